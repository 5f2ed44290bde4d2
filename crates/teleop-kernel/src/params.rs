//! Parameter Store.
//!
//! [`resolve`] validates the raw key/value arguments of a trial launch and
//! produces an immutable [`TrialParameters`].  It is a pure function: the
//! same arguments always give the same result, and resolving the
//! [`TrialParameters::to_raw`] form of a resolved set gives it back
//! unchanged.
//!
//! | Field | Type | Default | Constraint | Aliases |
//! |---|---|---|---|---|
//! | `participant_id` | integer | required | `> 0` | `part_id` |
//! | `autonomy_id` | integer | required | `0..=5` | `alpha_id`, `auto_id` |
//! | `trajectory_id` | integer | required | `0..=5` | `traj_id` |
//! | `mapping_ratio` | float | `3.0` | finite, `> 0` | |
//! | `use_depth` | bool | `false` | | |
//! | `free_drive` | bool | `false` | | |
//!
//! # Example
//!
//! ```rust
//! use teleop_kernel::params::{RawTrialArgs, resolve};
//!
//! let params = resolve(
//!     &RawTrialArgs::new()
//!         .set("part_id", "1")
//!         .set("autonomy_id", "2")
//!         .set("trajectory_id", "3")
//!         .set("mapping_ratio", "0.5"),
//! )
//! .unwrap();
//!
//! assert_eq!(params.key().to_string(), "part1_auto2_traj3");
//! assert!((params.effective_autonomy().human_weight() - 0.4).abs() < 1e-12);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use teleop_types::ValidationError;

pub const MAX_AUTONOMY_ID: u8 = 5;
pub const MAX_TRAJECTORY_ID: u8 = 5;
pub const DEFAULT_MAPPING_RATIO: f64 = 3.0;

const PARTICIPANT_ID: &str = "participant_id";
const AUTONOMY_ID: &str = "autonomy_id";
const TRAJECTORY_ID: &str = "trajectory_id";
const MAPPING_RATIO: &str = "mapping_ratio";
const USE_DEPTH: &str = "use_depth";
const FREE_DRIVE: &str = "free_drive";

/// Map an accepted key (canonical or alias) to its canonical name.
fn canonical(key: &str) -> Option<&'static str> {
    Some(match key {
        PARTICIPANT_ID | "part_id" => PARTICIPANT_ID,
        AUTONOMY_ID | "alpha_id" | "auto_id" => AUTONOMY_ID,
        TRAJECTORY_ID | "traj_id" => TRAJECTORY_ID,
        MAPPING_RATIO => MAPPING_RATIO,
        USE_DEPTH => USE_DEPTH,
        FREE_DRIVE => FREE_DRIVE,
        _ => return None,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Raw arguments
// ────────────────────────────────────────────────────────────────────────────

/// Unvalidated launch arguments, as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTrialArgs(BTreeMap<String, String>);

impl RawTrialArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawTrialArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Resolved parameters
// ────────────────────────────────────────────────────────────────────────────

/// Discrete autonomy condition.  Level `k` gives the human input a weight
/// of `k × 0.2`: 0 is fully autonomous, 5 is fully human-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AutonomyLevel(u8);

impl AutonomyLevel {
    pub const FULL_HUMAN: AutonomyLevel = AutonomyLevel(MAX_AUTONOMY_ID);

    pub fn value(self) -> u8 {
        self.0
    }

    /// Blend weight of the operator's input, in `[0, 1]`.
    pub fn human_weight(self) -> f64 {
        f64::from(self.0) * 0.2
    }

    pub fn robot_weight(self) -> f64 {
        1.0 - self.human_weight()
    }
}

/// Deterministic name of a trial's output: `part{P}_auto{A}_traj{T}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrialKey {
    pub participant_id: u32,
    pub autonomy_id: u8,
    pub trajectory_id: u8,
}

impl TrialKey {
    pub fn file_stem(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "part{}_auto{}_traj{}",
            self.participant_id, self.autonomy_id, self.trajectory_id
        )
    }
}

/// Validated, immutable trial configuration.  Only [`resolve`] builds one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialParameters {
    participant_id: u32,
    autonomy_id: u8,
    trajectory_id: u8,
    mapping_ratio: f64,
    use_depth: bool,
    free_drive: bool,
}

impl TrialParameters {
    pub fn participant_id(&self) -> u32 {
        self.participant_id
    }

    /// The autonomy condition as requested.  Recorded unchanged even in
    /// free-drive mode.
    pub fn autonomy_id(&self) -> u8 {
        self.autonomy_id
    }

    pub fn trajectory_id(&self) -> u8 {
        self.trajectory_id
    }

    pub fn mapping_ratio(&self) -> f64 {
        self.mapping_ratio
    }

    pub fn use_depth(&self) -> bool {
        self.use_depth
    }

    pub fn free_drive(&self) -> bool {
        self.free_drive
    }

    pub fn requested_autonomy(&self) -> AutonomyLevel {
        AutonomyLevel(self.autonomy_id)
    }

    /// The level components act on: free drive hands full control to the
    /// operator.
    pub fn effective_autonomy(&self) -> AutonomyLevel {
        if self.free_drive {
            AutonomyLevel::FULL_HUMAN
        } else {
            self.requested_autonomy()
        }
    }

    pub fn key(&self) -> TrialKey {
        TrialKey {
            participant_id: self.participant_id,
            autonomy_id: self.autonomy_id,
            trajectory_id: self.trajectory_id,
        }
    }

    /// Canonical raw form; `resolve(&p.to_raw()) == Ok(p)`.
    pub fn to_raw(&self) -> RawTrialArgs {
        RawTrialArgs::new()
            .set(PARTICIPANT_ID, self.participant_id.to_string())
            .set(AUTONOMY_ID, self.autonomy_id.to_string())
            .set(TRAJECTORY_ID, self.trajectory_id.to_string())
            .set(MAPPING_RATIO, self.mapping_ratio.to_string())
            .set(USE_DEPTH, self.use_depth.to_string())
            .set(FREE_DRIVE, self.free_drive.to_string())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// resolve
// ────────────────────────────────────────────────────────────────────────────

/// Validate `raw` into [`TrialParameters`].
///
/// # Errors
///
/// - [`ValidationError::UnknownField`] for a key that is neither a field
///   nor an alias.
/// - [`ValidationError::MissingField`] when an id is absent.
/// - [`ValidationError::TypeMismatch`] for unparsable values.
/// - [`ValidationError::OutOfRange`] for values outside their constraint,
///   or when a field and its alias disagree.
pub fn resolve(raw: &RawTrialArgs) -> Result<TrialParameters, ValidationError> {
    let mut fields: BTreeMap<&'static str, &str> = BTreeMap::new();
    for (key, value) in raw.iter() {
        let name = canonical(key).ok_or_else(|| ValidationError::UnknownField(key.to_string()))?;
        let value = value.trim();
        match fields.get(name) {
            Some(previous) if *previous != value => {
                return Err(ValidationError::OutOfRange {
                    field: name.to_string(),
                    value: format!("{previous} / {value}"),
                    constraint: "one value per field, aliases included".to_string(),
                });
            }
            _ => {
                fields.insert(name, value);
            }
        }
    }

    let participant_id = parse_int(&fields, PARTICIPANT_ID, 1, i64::from(u32::MAX), "> 0")?;
    let autonomy_id = parse_int(&fields, AUTONOMY_ID, 0, i64::from(MAX_AUTONOMY_ID), "0..=5")?;
    let trajectory_id =
        parse_int(&fields, TRAJECTORY_ID, 0, i64::from(MAX_TRAJECTORY_ID), "0..=5")?;

    let mapping_ratio = match fields.get(MAPPING_RATIO) {
        None => DEFAULT_MAPPING_RATIO,
        Some(value) => {
            let ratio: f64 = value
                .parse()
                .map_err(|_| mismatch(MAPPING_RATIO, value, "number"))?;
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err(ValidationError::OutOfRange {
                    field: MAPPING_RATIO.to_string(),
                    value: value.to_string(),
                    constraint: "finite and > 0".to_string(),
                });
            }
            ratio
        }
    };

    Ok(TrialParameters {
        // Bounds above make these conversions lossless.
        participant_id: participant_id as u32,
        autonomy_id: autonomy_id as u8,
        trajectory_id: trajectory_id as u8,
        mapping_ratio,
        use_depth: parse_bool(&fields, USE_DEPTH)?,
        free_drive: parse_bool(&fields, FREE_DRIVE)?,
    })
}

fn mismatch(field: &str, value: &str, expected: &str) -> ValidationError {
    ValidationError::TypeMismatch {
        field: field.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

fn parse_int(
    fields: &BTreeMap<&'static str, &str>,
    field: &'static str,
    min: i64,
    max: i64,
    constraint: &str,
) -> Result<i64, ValidationError> {
    let value = fields
        .get(field)
        .ok_or_else(|| ValidationError::MissingField(field.to_string()))?;
    let n: i64 = value.parse().map_err(|_| mismatch(field, value, "integer"))?;
    if !(min..=max).contains(&n) {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value: value.to_string(),
            constraint: constraint.to_string(),
        });
    }
    Ok(n)
}

fn parse_bool(
    fields: &BTreeMap<&'static str, &str>,
    field: &'static str,
) -> Result<bool, ValidationError> {
    match fields.get(field) {
        None => Ok(false),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(mismatch(field, value, "bool")),
        },
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> RawTrialArgs {
        RawTrialArgs::new()
            .set("participant_id", "1")
            .set("autonomy_id", "2")
            .set("trajectory_id", "3")
    }

    #[test]
    fn resolves_with_defaults() {
        let p = resolve(&base()).unwrap();
        assert_eq!(p.participant_id(), 1);
        assert_eq!(p.autonomy_id(), 2);
        assert_eq!(p.trajectory_id(), 3);
        assert_eq!(p.mapping_ratio(), DEFAULT_MAPPING_RATIO);
        assert!(!p.use_depth());
        assert!(!p.free_drive());
    }

    #[test]
    fn accepts_launch_aliases() {
        let raw = RawTrialArgs::new()
            .set("part_id", "7")
            .set("alpha_id", "4")
            .set("traj_id", "0");
        let p = resolve(&raw).unwrap();
        assert_eq!(p.key().to_string(), "part7_auto4_traj0");

        let raw = RawTrialArgs::new()
            .set("part_id", "7")
            .set("auto_id", "1")
            .set("traj_id", "0");
        assert_eq!(resolve(&raw).unwrap().autonomy_id(), 1);
    }

    #[test]
    fn conflicting_alias_is_rejected() {
        let raw = base().set("part_id", "2");
        assert!(matches!(
            resolve(&raw),
            Err(ValidationError::OutOfRange { field, .. }) if field == "participant_id"
        ));
        // Agreeing values are fine.
        assert!(resolve(&base().set("part_id", "1")).is_ok());
    }

    #[test]
    fn missing_id_is_reported() {
        let raw = RawTrialArgs::new().set("participant_id", "1").set("autonomy_id", "2");
        assert_eq!(
            resolve(&raw),
            Err(ValidationError::MissingField("trajectory_id".to_string()))
        );
    }

    #[test]
    fn unknown_key_is_reported() {
        assert_eq!(
            resolve(&base().set("speed", "fast")),
            Err(ValidationError::UnknownField("speed".to_string()))
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for (key, value) in [
            ("participant_id", "0"),
            ("participant_id", "-3"),
            ("autonomy_id", "6"),
            ("trajectory_id", "9"),
            ("mapping_ratio", "0"),
            ("mapping_ratio", "-1.5"),
            ("mapping_ratio", "inf"),
            ("mapping_ratio", "NaN"),
        ] {
            let result = resolve(&base().set(key, value));
            assert!(
                matches!(result, Err(ValidationError::OutOfRange { .. })),
                "{key}={value} gave {result:?}"
            );
        }
    }

    #[test]
    fn malformed_values_are_type_mismatches() {
        for (key, value) in [
            ("participant_id", "one"),
            ("autonomy_id", "2.5"),
            ("mapping_ratio", "fast"),
            ("use_depth", "maybe"),
        ] {
            let result = resolve(&base().set(key, value));
            assert!(
                matches!(result, Err(ValidationError::TypeMismatch { .. })),
                "{key}={value} gave {result:?}"
            );
        }
    }

    #[test]
    fn bools_accept_common_spellings() {
        let p = resolve(&base().set("use_depth", "TRUE").set("free_drive", "1")).unwrap();
        assert!(p.use_depth());
        assert!(p.free_drive());
        let p = resolve(&base().set("use_depth", "0")).unwrap();
        assert!(!p.use_depth());
    }

    #[test]
    fn free_drive_overrides_effective_autonomy_only() {
        let p = resolve(&base().set("free_drive", "true")).unwrap();
        assert_eq!(p.autonomy_id(), 2);
        assert_eq!(p.requested_autonomy().value(), 2);
        assert_eq!(p.effective_autonomy(), AutonomyLevel::FULL_HUMAN);
        assert!((p.effective_autonomy().human_weight() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn autonomy_weights_are_complementary() {
        let p = resolve(&base()).unwrap();
        let level = p.effective_autonomy();
        assert!((level.human_weight() - 0.4).abs() < 1e-12);
        assert!((level.human_weight() + level.robot_weight() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn parameters_serialize_losslessly() {
        let p = resolve(&base().set("mapping_ratio", "0.1")).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        let back: TrialParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }

    proptest! {
        #[test]
        fn resolve_is_deterministic_and_idempotent(
            participant in 1u32..10_000,
            autonomy in 0u8..=5,
            trajectory in 0u8..=5,
            ratio in 1e-3f64..100.0,
            use_depth: bool,
            free_drive: bool,
        ) {
            let raw = RawTrialArgs::new()
                .set("participant_id", participant.to_string())
                .set("autonomy_id", autonomy.to_string())
                .set("trajectory_id", trajectory.to_string())
                .set("mapping_ratio", ratio.to_string())
                .set("use_depth", use_depth.to_string())
                .set("free_drive", free_drive.to_string());

            let first = resolve(&raw).unwrap();
            let second = resolve(&raw).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(resolve(&first.to_raw()).unwrap(), first);
        }

        #[test]
        fn invalid_ids_never_resolve(
            autonomy in 6i64..1_000,
            trajectory in prop_oneof![-1_000i64..0, 6i64..1_000],
        ) {
            let bad_autonomy = base().set("autonomy_id", autonomy.to_string());
            prop_assert!(resolve(&bad_autonomy).is_err());
            let bad_trajectory = base().set("trajectory_id", trajectory.to_string());
            prop_assert!(resolve(&bad_trajectory).is_err());
        }
    }
}
