//! Trial output storage.
//!
//! A sealed recording is first persisted as *pending*; once the trial ends
//! the orchestrator finalizes it according to the outcome.
//!
//! # File layout
//!
//! | File | Written when |
//! |---|---|
//! | `part{P}_auto{A}_traj{T}.pending.json` | recording sealed, trial still running |
//! | `part{P}_auto{A}_traj{T}.json` | trial `Complete` |
//! | `part{P}_auto{A}_traj{T}.aborted.json` | trial `Aborted` after recording started |
//! | `part{P}_auto{A}_traj{T}.outcome.json` | every finished trial, with the reason trail |
//!
//! Every file is written to a temporary name and renamed into place, so a
//! reader never sees half a recording.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use teleop_kernel::TrialKey;
use teleop_types::{TrialError, TrialState};
use tracing::{debug, info};

use crate::orchestrator::TrialOutcome;
use crate::recorder::TrialRecording;

/// Where sealed recordings and trial outcomes go.
///
/// Implementations may block on I/O; the runtime only calls them from the
/// blocking pool.
pub trait TrialStore: Send + Sync {
    /// Persist a sealed recording as pending.  Returns where it was written.
    fn persist(&self, recording: &TrialRecording) -> Result<PathBuf, TrialError>;

    /// Mark the pending recording (if any) complete or aborted and record
    /// the outcome.  Returns the final recording location.
    fn finalize(&self, outcome: &TrialOutcome) -> Result<Option<PathBuf>, TrialError>;

    /// Whether completed output for `key` already exists.
    fn exists(&self, key: &TrialKey) -> bool;
}

// ────────────────────────────────────────────────────────────────────────────
// Files
// ────────────────────────────────────────────────────────────────────────────

pub struct FileTrialStore {
    dir: PathBuf,
}

impl FileTrialStore {
    /// Store rooted at `dir`, created if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TrialError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| storage_error(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{dir}/{stem}{suffix}`, e.g. suffix `.aborted.json`.
    pub fn path_for(&self, key: &TrialKey, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", key.file_stem()))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), TrialError> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| TrialError::Storage(format!("serialize {}: {e}", path.display())))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| storage_error(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| storage_error(path, e))
    }
}

impl TrialStore for FileTrialStore {
    fn persist(&self, recording: &TrialRecording) -> Result<PathBuf, TrialError> {
        let path = self.path_for(&recording.key, ".pending.json");
        self.write_json(&path, recording)?;
        debug!(path = %path.display(), samples = recording.samples.len(), "recording persisted");
        Ok(path)
    }

    fn finalize(&self, outcome: &TrialOutcome) -> Result<Option<PathBuf>, TrialError> {
        let final_path = match &outcome.recording {
            Some(pending) if pending.exists() => {
                let suffix = match outcome.final_state {
                    TrialState::Complete => ".json",
                    _ => ".aborted.json",
                };
                let target = self.path_for(&outcome.key, suffix);
                fs::rename(pending, &target).map_err(|e| storage_error(&target, e))?;
                Some(target)
            }
            _ => None,
        };

        let outcome_path = self.path_for(&outcome.key, ".outcome.json");
        self.write_json(&outcome_path, outcome)?;
        info!(
            key = %outcome.key,
            state = ?outcome.final_state,
            recording = ?final_path,
            "trial output finalized"
        );
        Ok(final_path)
    }

    fn exists(&self, key: &TrialKey) -> bool {
        self.path_for(key, ".json").exists()
    }
}

/// Read back a persisted recording (pending, complete or aborted).
pub fn load_recording(path: &Path) -> Result<TrialRecording, TrialError> {
    let bytes = fs::read(path).map_err(|e| storage_error(path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TrialError::Storage(format!("parse {}: {e}", path.display())))
}

fn storage_error(path: &Path, e: std::io::Error) -> TrialError {
    TrialError::Storage(format!("{}: {e}", path.display()))
}

// ────────────────────────────────────────────────────────────────────────────
// Memory
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    recordings: Vec<TrialRecording>,
    outcomes: Vec<TrialOutcome>,
    existing: HashSet<String>,
    failures_left: u32,
    persist_calls: u32,
}

/// In-memory store with failure injection.
#[derive(Default)]
pub struct MemoryTrialStore {
    state: Mutex<MemoryState>,
}

impl MemoryTrialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `failures` calls to `persist` fail.
    pub fn failing(failures: u32) -> Self {
        let store = Self::default();
        store.lock().failures_left = failures;
        store
    }

    /// Pretend completed output for `key` is already there.
    pub fn with_existing(self, key: &TrialKey) -> Self {
        self.lock().existing.insert(key.file_stem());
        self
    }

    pub fn recordings(&self) -> Vec<TrialRecording> {
        self.lock().recordings.clone()
    }

    pub fn outcomes(&self) -> Vec<TrialOutcome> {
        self.lock().outcomes.clone()
    }

    pub fn persist_calls(&self) -> u32 {
        self.lock().persist_calls
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TrialStore for MemoryTrialStore {
    fn persist(&self, recording: &TrialRecording) -> Result<PathBuf, TrialError> {
        let mut state = self.lock();
        state.persist_calls += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(TrialError::Storage("injected failure".to_string()));
        }
        state.recordings.push(recording.clone());
        Ok(PathBuf::from(format!("memory://{}", recording.key.file_stem())))
    }

    fn finalize(&self, outcome: &TrialOutcome) -> Result<Option<PathBuf>, TrialError> {
        let mut state = self.lock();
        if outcome.final_state == TrialState::Complete && outcome.recording.is_some() {
            state.existing.insert(outcome.key.file_stem());
        }
        state.outcomes.push(outcome.clone());
        Ok(outcome.recording.clone())
    }

    fn exists(&self, key: &TrialKey) -> bool {
        self.lock().existing.contains(&key.file_stem())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
