//! `teleop` – run and inspect teleoperation trials.
//!
//! | Command | Does |
//! |---|---|
//! | `teleop run` | launch one trial and write its recording |
//! | `teleop check` | resolve trial parameters only |
//! | `teleop inspect <file>` | summarize a persisted recording |
//! | `teleop init` | write a default `~/.teleop/config.toml` |
//!
//! Ctrl-C during `run` ends the recording window early but orderly: the
//! recording is still sealed and the trial completes.

mod config;
mod inspect;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use teleop_hal::SimDeviceFactory;
use teleop_kernel::{RawTrialArgs, resolve};
use teleop_runtime::{
    FileTrialStore, InputSource, ReplayLog, StandardTopology, TrialOrchestrator, TrialReport,
    init_tracing, load_recording, stop_channel,
};
use teleop_types::TrialState;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "teleop", version, about = "Teleoperation trial runtime")]
struct Cli {
    /// Config file to use instead of `~/.teleop/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch one trial.
    Run {
        #[command(flatten)]
        trial: TrialArgs,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Resolve trial parameters without launching anything.
    Check {
        #[command(flatten)]
        trial: TrialArgs,
    },
    /// Summarize a persisted recording.
    Inspect {
        path: PathBuf,
        /// Also write the recording out as a sensor log for `run --replay`.
        #[arg(long)]
        to_replay: Option<PathBuf>,
    },
    /// Write the default configuration file.
    Init {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Trial parameters.  Values stay strings so the parameter store reports
/// what is wrong with them.
#[derive(Args, Debug, Default)]
struct TrialArgs {
    #[arg(long, visible_alias = "part-id")]
    participant_id: Option<String>,
    #[arg(long, visible_alias = "alpha-id", alias = "auto-id")]
    autonomy_id: Option<String>,
    #[arg(long, visible_alias = "traj-id")]
    trajectory_id: Option<String>,
    #[arg(long)]
    mapping_ratio: Option<String>,
    #[arg(long)]
    use_depth: Option<String>,
    #[arg(long)]
    free_drive: Option<String>,
    /// Extra `key=value` trial parameter; may repeat.
    #[arg(long = "param", value_parser = parse_key_value)]
    params: Vec<(String, String)>,
}

impl TrialArgs {
    /// Raw arguments with config values filling the optional fields.
    fn to_raw(&self, cfg: &Config) -> RawTrialArgs {
        let mut raw = RawTrialArgs::new();
        for (key, value) in [
            ("participant_id", &self.participant_id),
            ("autonomy_id", &self.autonomy_id),
            ("trajectory_id", &self.trajectory_id),
        ] {
            if let Some(value) = value {
                raw.insert(key, value.as_str());
            }
        }
        raw.insert(
            "mapping_ratio",
            self.mapping_ratio
                .clone()
                .unwrap_or_else(|| cfg.mapping_ratio.to_string()),
        );
        raw.insert(
            "use_depth",
            self.use_depth.clone().unwrap_or_else(|| cfg.use_depth.to_string()),
        );
        raw.insert(
            "free_drive",
            self.free_drive.clone().unwrap_or_else(|| cfg.free_drive.to_string()),
        );
        for (key, value) in &self.params {
            raw.insert(key.as_str(), value.as_str());
        }
        raw
    }
}

#[derive(Args, Debug, Default)]
struct LaunchArgs {
    #[arg(long)]
    robot_ip: Option<String>,
    #[arg(long)]
    use_fake_hardware: Option<bool>,
    #[arg(long)]
    load_gripper: Option<bool>,
    #[arg(long)]
    use_rviz: Option<bool>,
    /// Drive the trial from a recorded sensor log instead of a device.
    #[arg(long)]
    replay: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Recording window, seconds.
    #[arg(long)]
    trial_duration: Option<f64>,
    /// Abort when the input device degrades.
    #[arg(long)]
    abort_on_degraded: bool,
    /// Allow re-running a trial whose output exists.
    #[arg(long)]
    overwrite: bool,
}

impl LaunchArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(v) = &self.robot_ip {
            cfg.robot_ip = v.clone();
        }
        if let Some(v) = self.use_fake_hardware {
            cfg.use_fake_hardware = v;
        }
        if let Some(v) = self.load_gripper {
            cfg.load_gripper = v;
        }
        if let Some(v) = self.use_rviz {
            cfg.use_rviz = v;
        }
        if let Some(v) = &self.output_dir {
            cfg.output_dir = v.clone();
        }
        if let Some(v) = self.trial_duration {
            cfg.trial_duration_secs = v;
        }
        cfg.abort_on_degraded |= self.abort_on_degraded;
        cfg.overwrite |= self.overwrite;
    }

    fn input(&self, cfg: &Config) -> Result<InputSource, String> {
        match &self.replay {
            Some(path) => Ok(InputSource::Replay(path.clone())),
            None if cfg.use_fake_hardware => {
                Ok(InputSource::Device(Arc::new(SimDeviceFactory::default())))
            }
            None => Err(concat!(
                "No haptic device driver is available: ",
                "pass --use-fake-hardware true or --replay <log>"
            )
            .to_string()),
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = init_tracing("teleop");

    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = match config::load_or_default(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            eprintln!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let result = match cli.command {
        Command::Run { trial, launch } => {
            launch.apply(&mut cfg);
            run(&trial, &launch, &cfg).await
        }
        Command::Check { trial } => check(&trial, &cfg),
        Command::Inspect { path, to_replay } => inspect(&path, to_replay.as_deref()),
        Command::Init { force } => init(&config_path, force),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(trial: &TrialArgs, launch: &LaunchArgs, cfg: &Config) -> Result<ExitCode, String> {
    let settings = cfg.settings()?;
    let input = launch.input(cfg)?;
    let store = Arc::new(FileTrialStore::new(&cfg.output_dir).map_err(|e| e.to_string())?);
    info!(
        robot_ip = %cfg.robot_ip,
        load_gripper = cfg.load_gripper,
        use_rviz = cfg.use_rviz,
        fake_hardware = cfg.use_fake_hardware,
        replay = ?launch.replay,
        output = %cfg.output_dir.display(),
        "launching trial"
    );

    let (trigger, signal) = stop_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – ending the trial …".yellow().bold());
        trigger.trigger();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the trial can only end on its timer");
    }

    let orchestrator = TrialOrchestrator::new(
        settings,
        Arc::new(StandardTopology::new(input)),
        store,
    );
    let report = orchestrator.run(&trial.to_raw(cfg), signal).await;
    print_report(&report);
    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &TrialReport) {
    let state = match report.final_state {
        TrialState::Complete => "COMPLETE".green().bold(),
        _ => "ABORTED".red().bold(),
    };
    let key = report.key.map_or_else(|| "-".to_string(), |k| k.to_string());
    println!("\n  Trial {} {}", key.bold(), state);
    if let Some(reason) = report.stop_reason {
        println!("  Stop reason : {:?}", reason);
    }
    println!("  Samples     : {}", report.sample_count);
    if let Some(path) = &report.recording {
        println!("  Recording   : {}", path.display());
    }
    for entry in &report.trail {
        println!(
            "  {} [{:?}] {}: {}",
            "✗".red(),
            entry.state,
            entry.component.as_deref().unwrap_or("trial"),
            entry.reason
        );
    }
    for (component, ack) in &report.shutdown {
        println!("  {:<20} {:?}", component.dimmed(), ack);
    }
}

fn check(trial: &TrialArgs, cfg: &Config) -> Result<ExitCode, String> {
    let params = resolve(&trial.to_raw(cfg)).map_err(|e| e.to_string())?;
    let key = params.key();
    println!("  {} {}", "✓".green(), key.to_string().bold());
    println!("  mapping_ratio      : {}", params.mapping_ratio());
    println!("  use_depth          : {}", params.use_depth());
    println!("  free_drive         : {}", params.free_drive());
    println!(
        "  effective autonomy : {} (human weight {:.1})",
        params.effective_autonomy().value(),
        params.effective_autonomy().human_weight()
    );
    let existing = cfg.output_dir.join(format!("{}.json", key.file_stem()));
    if existing.exists() {
        println!("  {} output already exists: {}", "!".yellow(), existing.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn inspect(
    path: &std::path::Path,
    to_replay: Option<&std::path::Path>,
) -> Result<ExitCode, String> {
    let recording = load_recording(path).map_err(|e| e.to_string())?;
    let summary = inspect::summarize(&recording);
    println!("  {} ({:?})", summary.key.bold(), summary.seal_reason);
    println!("  run id       : {}", recording.run_id);
    println!("  started      : {}", recording.started_at);
    println!("  duration     : {:.3} s", summary.duration.as_secs_f64());
    println!(
        "  samples      : {} device / {} robot ({:.1} Hz)",
        summary.device_samples, summary.robot_samples, summary.device_rate_hz
    );
    println!("  path length  : {:.3} m", summary.path_length_m);
    if let (Some(mean), Some(max)) = (summary.mean_tracking_error_m, summary.max_tracking_error_m) {
        println!("  tracking err : mean {:.4} m, max {:.4} m", mean, max);
    }
    let c = &recording.counters;
    println!(
        "  dropped      : {} orphaned, {} before start, {} after seal, {} in transit",
        c.orphaned, c.before_start, c.dropped_after_seal, c.dropped_in_transit
    );

    if let Some(out) = to_replay {
        let log = ReplayLog::from_recording(&recording);
        log.write(out).map_err(|e| e.to_string())?;
        println!(
            "  {} sensor log with {} entries ({:.1} s) written to {}",
            "✓".green(),
            log.len(),
            log.duration().as_secs_f64(),
            out.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn init(path: &std::path::Path, force: bool) -> Result<ExitCode, String> {
    if path.exists() && !force {
        return Err(format!("{} exists; pass --force to replace it", path.display()));
    }
    config::save_to(&Config::default(), path)?;
    println!("  {} wrote {}", "✓".green(), path.display());
    Ok(ExitCode::SUCCESS)
}
