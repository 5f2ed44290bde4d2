//! Lab configuration – reads/writes `~/.teleop/config.toml`.
//!
//! Precedence, lowest first: built-in defaults, the config file, `TELEOP_*`
//! environment variables, command-line flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use teleop_runtime::TrialSettings;

/// Persisted lab setup stored in `~/.teleop/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address of the robot controller.  Recorded, not dialled.
    #[serde(default = "default_robot_ip")]
    pub robot_ip: String,

    /// Drive the trial from the simulated haptic device.
    #[serde(default)]
    pub use_fake_hardware: bool,

    #[serde(default = "default_true")]
    pub load_gripper: bool,

    #[serde(default = "default_true")]
    pub use_rviz: bool,

    #[serde(default)]
    pub free_drive: bool,

    /// Device → robot scale used when a trial does not set one.
    #[serde(default = "default_mapping_ratio")]
    pub mapping_ratio: f64,

    #[serde(default)]
    pub use_depth: bool,

    /// Where recordings and outcomes are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Recording window, seconds.
    #[serde(default = "default_trial_duration")]
    pub trial_duration_secs: f64,

    #[serde(default = "default_device_rate")]
    pub device_rate_hz: f64,

    #[serde(default)]
    pub abort_on_degraded: bool,

    #[serde(default)]
    pub overwrite: bool,
}

fn default_robot_ip() -> String {
    "172.16.0.2".to_string()
}
fn default_true() -> bool {
    true
}
fn default_mapping_ratio() -> f64 {
    3.0
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("trials")
}
fn default_trial_duration() -> f64 {
    10.0
}
fn default_device_rate() -> f64 {
    100.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_ip: default_robot_ip(),
            use_fake_hardware: false,
            load_gripper: true,
            use_rviz: true,
            free_drive: false,
            mapping_ratio: default_mapping_ratio(),
            use_depth: false,
            output_dir: default_output_dir(),
            trial_duration_secs: default_trial_duration(),
            device_rate_hz: default_device_rate(),
            abort_on_degraded: false,
            overwrite: false,
        }
    }
}

impl Config {
    /// Runtime settings derived from this configuration.
    pub fn settings(&self) -> Result<TrialSettings, String> {
        let duration = Duration::try_from_secs_f64(self.trial_duration_secs)
            .map_err(|e| format!("Invalid trial duration {}: {}", self.trial_duration_secs, e))?;
        if duration.is_zero() {
            return Err("Trial duration must be positive".to_string());
        }
        if !(self.device_rate_hz.is_finite() && self.device_rate_hz > 0.0) {
            return Err(format!("Invalid device rate {}", self.device_rate_hz));
        }
        Ok(TrialSettings {
            trial_duration: duration,
            device_rate_hz: self.device_rate_hz,
            abort_on_degraded: self.abort_on_degraded,
            overwrite: self.overwrite,
            ..TrialSettings::default()
        })
    }
}

/// Return the path to `~/.teleop/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".teleop").join("config.toml")
}

/// Load the config from `path`, falling back to defaults when the file is
/// absent.  Environment overrides apply either way.
pub fn load_or_default(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `TELEOP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TELEOP_ROBOT_IP` | `robot_ip` |
/// | `TELEOP_USE_FAKE_HARDWARE` | `use_fake_hardware` |
/// | `TELEOP_MAPPING_RATIO` | `mapping_ratio` |
/// | `TELEOP_USE_DEPTH` | `use_depth` |
/// | `TELEOP_OUTPUT_DIR` | `output_dir` |
/// | `TELEOP_TRIAL_DURATION` | `trial_duration_secs` |
/// | `TELEOP_ABORT_ON_DEGRADED` | `abort_on_degraded` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TELEOP_ROBOT_IP") {
        cfg.robot_ip = v;
    }
    if let Some(b) = env_bool("TELEOP_USE_FAKE_HARDWARE") {
        cfg.use_fake_hardware = b;
    }
    if let Ok(v) = std::env::var("TELEOP_MAPPING_RATIO")
        && let Ok(ratio) = v.parse::<f64>()
    {
        cfg.mapping_ratio = ratio;
    }
    if let Some(b) = env_bool("TELEOP_USE_DEPTH") {
        cfg.use_depth = b;
    }
    if let Ok(v) = std::env::var("TELEOP_OUTPUT_DIR") {
        cfg.output_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("TELEOP_TRIAL_DURATION")
        && let Ok(secs) = v.parse::<f64>()
    {
        cfg.trial_duration_secs = secs;
    }
    if let Some(b) = env_bool("TELEOP_ABORT_ON_DEGRADED") {
        cfg.abort_on_degraded = b;
    }
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
