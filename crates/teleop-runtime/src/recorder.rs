//! Trajectory recorder.
//!
//! [`TrajectoryRecorder`] is the pure state machine; [`RecorderComponent`]
//! feeds it from the bus and persists the sealed result.
//!
//! ```text
//!   Idle ──arm──▶ Armed ──start(at)──▶ Recording ──seal(at, reason)──▶ Sealed
//!    │                                     ▲
//!    └──────────────start(at)──────────────┘
//! ```
//!
//! | State | Incoming sample |
//! |---|---|
//! | `Idle` | discarded |
//! | `Armed` | buffered; the buffer is thrown away on `start` |
//! | `Recording` | appended with `timestamp - start`; older than start → discarded |
//! | `Sealed` | dropped and counted |
//!
//! A robot sample is only recorded if its `cause` lies within the range of
//! device sequence numbers already recorded.  A sealed recorder never
//! records again.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teleop_kernel::{TrialKey, TrialParameters};
use teleop_middleware::{Envelope, QueuePolicy, Subscription, topics};
use teleop_types::{Message, PoseSample, PoseSource, TrialError};
use tokio::task::spawn_blocking;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::component::{Component, ComponentContext, ControlSignal, EventKind};
use crate::settings::TrialSettings;
use crate::storage::TrialStore;

pub const RECORDER_ID: &str = "trajectory_recorder";

const HEARTBEAT_PERIOD: Duration = Duration::from_millis(250);

// ────────────────────────────────────────────────────────────────────────────
// Data
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecorderState {
    Idle,
    Armed,
    Recording,
    Sealed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealReason {
    /// The orchestrator closed the window.
    Stopped,
    /// The window hit its maximum length without a Stop.
    MaxDuration,
}

/// What [`TrajectoryRecorder::append`] did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Discarded,
    Buffered,
    Recorded,
    BeforeStart,
    Orphaned,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderCounters {
    pub recorded: u64,
    pub discarded_idle: u64,
    pub discarded_armed: u64,
    pub before_start: u64,
    pub orphaned: u64,
    pub dropped_after_seal: u64,
    /// Samples the bus could not deliver to the recorder in time.
    pub dropped_in_transit: u64,
}

/// A sealed trial recording.  Timestamps are relative to the start instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecording {
    pub run_id: Uuid,
    pub key: TrialKey,
    pub parameters: TrialParameters,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Bus-clock instant the window opened at.
    pub start_offset: Duration,
    pub duration: Duration,
    pub seal_reason: SealReason,
    pub samples: Vec<PoseSample>,
    pub counters: RecorderCounters,
}

impl TrialRecording {
    pub fn device_samples(&self) -> impl Iterator<Item = &PoseSample> {
        self.samples.iter().filter(|s| s.source == PoseSource::Device)
    }

    pub fn robot_samples(&self) -> impl Iterator<Item = &PoseSample> {
        self.samples.iter().filter(|s| s.source == PoseSource::Robot)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// State machine
// ────────────────────────────────────────────────────────────────────────────

pub struct TrajectoryRecorder {
    run_id: Uuid,
    params: Arc<TrialParameters>,
    state: RecorderState,
    armed: Vec<PoseSample>,
    samples: Vec<PoseSample>,
    start_at: Duration,
    started_wall: DateTime<Utc>,
    /// Recorded device samples: seq to trial-relative timestamp.
    device_seen: BTreeMap<u64, Duration>,
    /// Longest a robot sample may trail its cause.
    cycle: Duration,
    counters: RecorderCounters,
}

impl TrajectoryRecorder {
    pub fn new(run_id: Uuid, params: Arc<TrialParameters>) -> Self {
        Self {
            run_id,
            params,
            state: RecorderState::Idle,
            armed: Vec::new(),
            samples: Vec::new(),
            start_at: Duration::ZERO,
            started_wall: Utc::now(),
            device_seen: BTreeMap::new(),
            cycle: TrialSettings::default().device_period(),
            counters: RecorderCounters::default(),
        }
    }

    /// Robot samples must follow their device sample within `cycle`.
    pub fn with_cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn counters(&self) -> RecorderCounters {
        self.counters
    }

    /// `Idle → Armed`.  Returns `false` in any other state.
    pub fn arm(&mut self) -> bool {
        if self.state != RecorderState::Idle {
            return false;
        }
        self.state = RecorderState::Armed;
        true
    }

    /// Open the window at bus time `at`.  Allowed from `Idle` and `Armed`.
    pub fn start(&mut self, at: Duration) -> bool {
        if !matches!(self.state, RecorderState::Idle | RecorderState::Armed) {
            return false;
        }
        self.counters.discarded_armed += self.armed.len() as u64;
        self.armed.clear();
        self.start_at = at;
        self.started_wall = Utc::now();
        self.state = RecorderState::Recording;
        true
    }

    pub fn append(&mut self, mut sample: PoseSample) -> AppendOutcome {
        match self.state {
            RecorderState::Idle => {
                self.counters.discarded_idle += 1;
                AppendOutcome::Discarded
            }
            RecorderState::Armed => {
                self.armed.push(sample);
                AppendOutcome::Buffered
            }
            RecorderState::Sealed => {
                if self.counters.dropped_after_seal == 0 {
                    warn!(seq = sample.seq, "sample after seal dropped");
                }
                self.counters.dropped_after_seal += 1;
                AppendOutcome::Dropped
            }
            RecorderState::Recording => {
                let Some(relative) = sample.timestamp.checked_sub(self.start_at) else {
                    self.counters.before_start += 1;
                    return AppendOutcome::BeforeStart;
                };
                match sample.source {
                    PoseSource::Device => {
                        self.device_seen.insert(sample.seq, relative);
                    }
                    PoseSource::Robot => {
                        let caused = sample
                            .cause
                            .and_then(|cause| self.device_seen.get(&cause))
                            .and_then(|&device_at| relative.checked_sub(device_at))
                            .is_some_and(|lag| lag <= self.cycle);
                        if !caused {
                            debug!(
                                seq = sample.seq,
                                cause = ?sample.cause,
                                "robot sample without recorded cause"
                            );
                            self.counters.orphaned += 1;
                            return AppendOutcome::Orphaned;
                        }
                    }
                }
                sample.timestamp = relative;
                self.samples.push(sample);
                self.counters.recorded += 1;
                AppendOutcome::Recorded
            }
        }
    }

    /// Total samples the bus dropped on the way to this recorder.
    pub fn note_in_transit_drops(&mut self, total: u64) {
        self.counters.dropped_in_transit = total;
    }

    /// Close the window at bus time `at`.
    ///
    /// Returns the recording when the recorder was `Recording`; samples
    /// stamped after `at` are excluded and counted as dropped.  From `Idle`
    /// or `Armed` the recorder seals empty-handed.  Sealing twice yields
    /// `None`.
    pub fn seal(&mut self, at: Duration, reason: SealReason) -> Option<TrialRecording> {
        let was = self.state;
        self.state = RecorderState::Sealed;
        self.armed.clear();
        if was != RecorderState::Recording {
            return None;
        }

        let duration = at.saturating_sub(self.start_at);
        let mut samples = std::mem::take(&mut self.samples);
        let before = samples.len();
        samples.retain(|s| s.timestamp <= duration);
        let late = (before - samples.len()) as u64;
        self.counters.recorded -= late;
        self.counters.dropped_after_seal += late;

        let ended_wall = self.started_wall
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        info!(
            samples = samples.len(),
            ?duration,
            ?reason,
            orphaned = self.counters.orphaned,
            "recording sealed"
        );
        Some(TrialRecording {
            run_id: self.run_id,
            key: self.params.key(),
            parameters: (*self.params).clone(),
            started_at: self.started_wall,
            ended_at: ended_wall,
            start_offset: self.start_at,
            duration,
            seal_reason: reason,
            samples,
            counters: self.counters,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Component
// ────────────────────────────────────────────────────────────────────────────

pub struct RecorderComponent {
    run_id: Uuid,
    params: Arc<TrialParameters>,
    store: Arc<dyn TrialStore>,
    capacity: usize,
    send_timeout: Duration,
    max_duration: Duration,
    persist_attempts: u32,
    persist_backoff: Duration,
    cycle: Duration,
}

impl RecorderComponent {
    pub fn new(
        run_id: Uuid,
        params: Arc<TrialParameters>,
        store: Arc<dyn TrialStore>,
        settings: &TrialSettings,
    ) -> Self {
        Self {
            run_id,
            params,
            store,
            capacity: settings.recorder_capacity(),
            send_timeout: settings.reliable_send_timeout,
            max_duration: settings.max_recording_duration(),
            persist_attempts: settings.persist_attempts.max(1),
            persist_backoff: settings.persist_backoff,
            cycle: settings.device_period(),
        }
    }

    /// Persist with exponential backoff between attempts.  Store calls run
    /// on the blocking pool.
    async fn persist(&self, recording: Arc<TrialRecording>) -> Result<PathBuf, String> {
        let mut backoff = self.persist_backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.persist_attempts {
            let store = Arc::clone(&self.store);
            let pending = Arc::clone(&recording);
            let result = spawn_blocking(move || store.persist(&pending))
                .await
                .unwrap_or_else(|e| Err(TrialError::Storage(format!("persist task failed: {e}"))));
            match result {
                Ok(path) => return Ok(path),
                Err(e) => {
                    warn!(attempt, error = %e, "persisting recording failed");
                    last_error = e.to_string();
                    if attempt < self.persist_attempts {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn seal(
        &self,
        ctx: &ComponentContext,
        recorder: &mut TrajectoryRecorder,
        at: Duration,
        reason: SealReason,
    ) {
        let Some(recording) = recorder.seal(at, reason) else {
            return;
        };
        let samples = recording.samples.len();
        match self.persist(Arc::new(recording)).await {
            Ok(path) => ctx.report(EventKind::Sealed {
                path,
                samples,
                reason,
            }),
            Err(error) => ctx.report(EventKind::SealFailed {
                attempts: self.persist_attempts,
                reason: error,
            }),
        }
    }
}

fn append_envelope(recorder: &mut TrajectoryRecorder, envelope: Envelope) {
    if let Message::Pose(sample) = envelope.message {
        recorder.append(sample);
    }
}

/// Take everything already queued, device samples first.
fn drain(device: &mut Subscription, robot: &mut Subscription, recorder: &mut TrajectoryRecorder) {
    while let Some(envelope) = device.try_recv() {
        append_envelope(recorder, envelope);
    }
    while let Some(envelope) = robot.try_recv() {
        append_envelope(recorder, envelope);
    }
    recorder.note_in_transit_drops(device.dropped() + robot.dropped());
}

#[async_trait]
impl Component for RecorderComponent {
    fn id(&self) -> &str {
        RECORDER_ID
    }

    async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
        let policy = QueuePolicy::Reliable {
            capacity: self.capacity,
            send_timeout: self.send_timeout,
        };
        let mut device = ctx.bus().subscribe(&topics::DEVICE_POSE, policy)?;
        let mut robot = ctx.bus().subscribe(&topics::ROBOT_TARGET, policy)?;
        let clock = ctx.bus().clock();

        let mut recorder =
            TrajectoryRecorder::new(self.run_id, Arc::clone(&self.params)).with_cycle(self.cycle);
        let mut heartbeat = interval(HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline: Option<(Instant, Duration)> = None;

        info!(key = %self.params.key(), capacity = self.capacity, "recorder ready");
        ctx.set_ready();

        loop {
            let recording = recorder.state() == RecorderState::Recording;
            let timeout_at = deadline.map_or_else(Instant::now, |(instant, _)| instant);
            tokio::select! {
                biased;
                signal = ctx.recv_control() => match signal {
                    ControlSignal::Arm => {
                        recorder.arm();
                    }
                    ControlSignal::Start { at } => {
                        if recorder.start(at) {
                            let end = at + self.max_duration;
                            deadline = Some((clock.instant_at(end), end));
                            info!(?at, "recording started");
                        }
                    }
                    ControlSignal::Stop { at } => {
                        drain(&mut device, &mut robot, &mut recorder);
                        self.seal(ctx, &mut recorder, at, SealReason::Stopped).await;
                    }
                    ControlSignal::Shutdown => {
                        if recording {
                            warn!("shut down while recording; nothing persisted");
                        }
                        debug!(counters = ?recorder.counters(), "recorder shutting down");
                        return Ok(());
                    }
                },
                Some(envelope) = device.recv() => append_envelope(&mut recorder, envelope),
                Some(envelope) = robot.recv() => append_envelope(&mut recorder, envelope),
                _ = sleep_until(timeout_at), if recording && deadline.is_some() => {
                    let end = deadline.map_or(Duration::ZERO, |(_, end)| end);
                    warn!(?end, "no stop before the maximum duration; sealing");
                    drain(&mut device, &mut robot, &mut recorder);
                    self.seal(ctx, &mut recorder, end, SealReason::MaxDuration).await;
                }
                _ = heartbeat.tick() => ctx.heartbeat(),
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
