//! Trial orchestrator.
//!
//! Drives one trial through its lifecycle and guarantees it ends in exactly
//! one terminal state:
//!
//! ```text
//! Resolving ─▶ Launching ─▶ AwaitingReady ─▶ Running ─▶ Stopping ─▶ Complete
//!     │            │              │              │           │
//!     └────────────┴──────────────┴──────────────┴───────────┴──▶ Aborted
//! ```
//!
//! | State | Leaves when |
//! |---|---|
//! | `Resolving` | parameters resolve (or abort with zero components started) |
//! | `Launching` | the topology (which must include the recorder) is built and every component spawned |
//! | `AwaitingReady` | all components report `Ready`; `Failed`, the readiness timeout or an external stop abort |
//! | `Running` | trial duration elapsed, external stop, replay finished or max-duration seal; any component failure, stale heartbeat, seal failure or (optionally) degraded input aborts |
//! | `Stopping` | the recorder reports `Sealed` (bounded wait); no seal aborts |
//!
//! Whatever the path, every spawned component is shut down in reverse launch
//! order with a grace period, and the store finalizes the output so an
//! aborted trial is marked as such.

use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teleop_kernel::{RawTrialArgs, TrialKey, TrialParameters, Watchdog, resolve};
use teleop_middleware::{BusConfig, MessageBus, Publisher, topics};
use teleop_types::{AbortEntry, Message, TrialError, TrialState, Trigger, ValidationError};
use tokio::sync::{mpsc, watch};
use tokio::task::spawn_blocking;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::component::{
    ComponentEvent, ComponentHandle, ControlSignal, EventKind, Readiness, ShutdownAck,
};
use crate::recorder::{RECORDER_ID, SealReason};
use crate::settings::TrialSettings;
use crate::storage::TrialStore;
use crate::topology::{TopologyFactory, TrialContext};

const ORCHESTRATOR_ID: &str = "orchestrator";

// ────────────────────────────────────────────────────────────────────────────
// External stop
// ────────────────────────────────────────────────────────────────────────────

/// Requests an early, orderly end of the trial (e.g. on Ctrl-C).
#[derive(Clone)]
pub struct StopTrigger(Arc<watch::Sender<bool>>);

impl StopTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// The orchestrator's side of a [`StopTrigger`].
#[derive(Clone)]
pub struct StopSignal(Option<watch::Receiver<bool>>);

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self(None)
    }

    pub fn is_triggered(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once triggered.  Pends forever if the trigger is dropped
    /// without firing.
    pub async fn wait(&mut self) {
        if let Some(rx) = self.0.as_mut() {
            if rx.wait_for(|stop| *stop).await.is_ok() {
                return;
            }
        }
        pending::<()>().await;
    }
}

pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger(Arc::new(tx)), StopSignal(Some(rx)))
}

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

/// Why a trial left `Running` normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    External,
    ReplayFinished,
    MaxDuration,
}

/// The orchestrator entered `state` this long after the trial began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: TrialState,
    pub at: Duration,
}

/// What the store persists next to a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub run_id: Uuid,
    pub key: TrialKey,
    pub final_state: TrialState,
    pub parameters: TrialParameters,
    pub stop_reason: Option<StopReason>,
    pub sample_count: usize,
    pub trail: Vec<AbortEntry>,
    /// Where the sealed recording was persisted, if it was.
    pub recording: Option<PathBuf>,
    pub finished_at: DateTime<Utc>,
}

/// Everything observable about one trial run.
#[derive(Debug, Clone)]
pub struct TrialReport {
    pub run_id: Uuid,
    /// `None` when the parameters never resolved.
    pub key: Option<TrialKey>,
    pub final_state: TrialState,
    pub parameters: Option<TrialParameters>,
    pub transitions: Vec<StateTransition>,
    pub trail: Vec<AbortEntry>,
    /// Per component, in shutdown order.
    pub shutdown: Vec<(String, ShutdownAck)>,
    pub handles_created: usize,
    pub recording: Option<PathBuf>,
    pub sample_count: usize,
    pub stop_reason: Option<StopReason>,
}

impl TrialReport {
    pub fn is_complete(&self) -> bool {
        self.final_state == TrialState::Complete
    }

    pub fn shutdown_ack(&self, component: &str) -> Option<ShutdownAck> {
        self.shutdown
            .iter()
            .find(|(id, _)| id == component)
            .map(|(_, ack)| *ack)
    }

    pub fn states(&self) -> Vec<TrialState> {
        self.transitions.iter().map(|t| t.state).collect()
    }

    /// `Ok` for a complete trial, [`TrialError::Aborted`] with the reason
    /// trail otherwise.
    pub fn into_result(self) -> Result<Self, TrialError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(TrialError::Aborted { trail: self.trail })
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bookkeeping for one run
// ────────────────────────────────────────────────────────────────────────────

enum RunEnd {
    Stop(StopReason),
    Abort,
}

struct Sealed {
    path: PathBuf,
    samples: usize,
}

struct Run {
    began: Instant,
    state: TrialState,
    transitions: Vec<StateTransition>,
    trail: Vec<AbortEntry>,
    sealed: Option<Sealed>,
    /// The recorder reported `Sealed` or `SealFailed`.
    seal_settled: bool,
}

impl Run {
    fn new() -> Self {
        let mut run = Self {
            began: Instant::now(),
            state: TrialState::Resolving,
            transitions: Vec::new(),
            trail: Vec::new(),
            sealed: None,
            seal_settled: false,
        };
        run.enter(TrialState::Resolving);
        run
    }

    fn enter(&mut self, state: TrialState) {
        info!(from = ?self.state, to = ?state, "trial state");
        self.state = state;
        self.transitions.push(StateTransition {
            state,
            at: self.began.elapsed(),
        });
    }

    fn fail(&mut self, component: Option<&str>, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(state = ?self.state, component, %reason, "trial failure");
        self.trail.push(AbortEntry {
            component: component.map(str::to_string),
            state: self.state,
            reason,
        });
    }

    /// React to a component event while `Running`.
    fn running_event(&mut self, event: ComponentEvent, abort_on_degraded: bool) -> Option<RunEnd> {
        let component = event.component.as_str();
        match event.kind {
            EventKind::Degraded {
                consecutive_failures,
            } => {
                if abort_on_degraded {
                    let err = TrialError::DegradedInput {
                        component: component.to_string(),
                        consecutive_failures,
                    };
                    self.fail(Some(component), err.to_string());
                    return Some(RunEnd::Abort);
                }
                warn!(component, consecutive_failures, "input degraded; trial continues");
                None
            }
            EventKind::Recovered => {
                info!(component, "input recovered");
                None
            }
            EventKind::ReplayFinished { messages } => {
                info!(component, messages, "sensor log exhausted");
                Some(RunEnd::Stop(StopReason::ReplayFinished))
            }
            EventKind::Sealed {
                path,
                samples,
                reason,
            } => {
                self.sealed = Some(Sealed { path, samples });
                self.seal_settled = true;
                (reason == SealReason::MaxDuration).then_some(RunEnd::Stop(StopReason::MaxDuration))
            }
            EventKind::SealFailed { attempts, reason } => {
                self.seal_settled = true;
                let err = TrialError::SealPersistence { attempts, reason };
                self.fail(Some(component), err.to_string());
                Some(RunEnd::Abort)
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

pub struct TrialOrchestrator {
    settings: TrialSettings,
    topology: Arc<dyn TopologyFactory>,
    store: Arc<dyn TrialStore>,
}

impl TrialOrchestrator {
    pub fn new(
        settings: TrialSettings,
        topology: Arc<dyn TopologyFactory>,
        store: Arc<dyn TrialStore>,
    ) -> Self {
        Self {
            settings,
            topology,
            store,
        }
    }

    pub fn settings(&self) -> &TrialSettings {
        &self.settings
    }

    /// Run one trial to a terminal state.
    pub async fn run(&self, raw: &RawTrialArgs, stop: StopSignal) -> TrialReport {
        let run_id = Uuid::new_v4();
        self.run_trial(run_id, raw, stop)
            .instrument(info_span!("trial", %run_id))
            .await
    }

    async fn run_trial(
        &self,
        run_id: Uuid,
        raw: &RawTrialArgs,
        mut stop: StopSignal,
    ) -> TrialReport {
        let mut run = Run::new();

        // ── Resolving ───────────────────────────────────────────────────────
        let params = match self.resolve(raw) {
            Ok(params) => Arc::new(params),
            Err(e) => {
                run.fail(None, TrialError::from(e).to_string());
                run.enter(TrialState::Aborted);
                return TrialReport {
                    run_id,
                    key: None,
                    final_state: TrialState::Aborted,
                    parameters: None,
                    transitions: run.transitions,
                    trail: run.trail,
                    shutdown: Vec::new(),
                    handles_created: 0,
                    recording: None,
                    sample_count: 0,
                    stop_reason: None,
                };
            }
        };
        info!(key = %params.key(), ratio = params.mapping_ratio(), "trial parameters resolved");

        // ── Launching ───────────────────────────────────────────────────────
        run.enter(TrialState::Launching);
        let bus = MessageBus::new(BusConfig {
            liveness_timeout: self.settings.heartbeat_timeout,
        });
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let context = TrialContext {
            run_id,
            params: Arc::clone(&params),
            settings: self.settings.clone(),
            store: Arc::clone(&self.store),
        };
        let mut handles = Vec::new();
        let mut record_pub = None;
        match self.topology.build(&context) {
            Ok(components) if !components.iter().any(|c| c.id() == RECORDER_ID) => {
                run.fail(None, format!("topology has no `{RECORDER_ID}` component"));
            }
            Ok(components) => {
                for component in components {
                    debug!(component = component.id(), "launching");
                    handles.push(ComponentHandle::spawn(component, bus.clone(), events_tx.clone()));
                }
                match bus.advertise(&topics::RECORD, ORCHESTRATOR_ID) {
                    Ok(publisher) => record_pub = Some(publisher),
                    Err(e) => run.fail(None, e.to_string()),
                }
            }
            Err(e) => run.fail(None, e.to_string()),
        }
        let handles_created = handles.len();

        // ── AwaitingReady / Running / Stopping ──────────────────────────────
        let mut stop_reason = None;
        if run.trail.is_empty() {
            run.enter(TrialState::AwaitingReady);
            if self.await_ready(&mut run, &handles, &mut stop).await {
                for handle in &handles {
                    handle.signal(ControlSignal::Arm);
                }
                stop_reason = self
                    .run_window(
                        &mut run,
                        &bus,
                        &handles,
                        &mut events,
                        &mut stop,
                        record_pub.as_ref(),
                    )
                    .await;
            }
        }

        // ── Teardown ────────────────────────────────────────────────────────
        let mut shutdown = Vec::with_capacity(handles.len());
        for handle in handles.into_iter().rev() {
            let id = handle.id().to_string();
            let ack = handle.shutdown(self.settings.shutdown_grace).await;
            debug!(component = %id, ?ack, "shut down");
            shutdown.push((id, ack));
        }
        drop(record_pub);

        let mut final_state = if run.trail.is_empty() {
            TrialState::Complete
        } else {
            TrialState::Aborted
        };
        let sample_count = run.sealed.as_ref().map_or(0, |s| s.samples);
        let outcome = TrialOutcome {
            run_id,
            key: params.key(),
            final_state,
            parameters: (*params).clone(),
            stop_reason,
            sample_count,
            trail: run.trail.clone(),
            recording: run.sealed.as_ref().map(|s| s.path.clone()),
            finished_at: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        let finalizing = outcome.clone();
        let finalized = spawn_blocking(move || store.finalize(&finalizing))
            .await
            .unwrap_or_else(|e| Err(TrialError::Storage(format!("finalize task failed: {e}"))));
        let recording = match finalized {
            Ok(path) => path,
            Err(e) => {
                run.fail(None, e.to_string());
                final_state = TrialState::Aborted;
                outcome.recording
            }
        };
        run.enter(final_state);
        info!(
            key = %params.key(),
            state = ?final_state,
            samples = sample_count,
            recording = ?recording,
            "trial finished"
        );

        TrialReport {
            run_id,
            key: Some(params.key()),
            final_state,
            parameters: Some((*params).clone()),
            transitions: run.transitions,
            trail: run.trail,
            shutdown,
            handles_created,
            recording,
            sample_count,
            stop_reason,
        }
    }

    fn resolve(&self, raw: &RawTrialArgs) -> Result<TrialParameters, ValidationError> {
        let params = resolve(raw)?;
        let key = params.key();
        if !self.settings.overwrite && self.store.exists(&key) {
            return Err(ValidationError::DuplicateTrial(key.file_stem()));
        }
        Ok(params)
    }

    /// Poll readiness until every component is `Ready`.  Returns `false`
    /// after recording why not.
    async fn await_ready(
        &self,
        run: &mut Run,
        handles: &[ComponentHandle],
        stop: &mut StopSignal,
    ) -> bool {
        let waited_from = Instant::now();
        let deadline = waited_from + self.settings.readiness_timeout;
        loop {
            let mut all_ready = true;
            for handle in handles {
                match handle.readiness() {
                    Readiness::Ready => {}
                    Readiness::Starting => all_ready = false,
                    Readiness::Failed(reason) => {
                        run.fail(Some(handle.id()), reason);
                        return false;
                    }
                    Readiness::Stopped => {
                        run.fail(Some(handle.id()), "exited before the trial started");
                        return false;
                    }
                }
            }
            if all_ready {
                info!(
                    components = handles.len(),
                    waited = ?waited_from.elapsed(),
                    "all components ready"
                );
                return true;
            }
            if Instant::now() >= deadline {
                for handle in handles {
                    if handle.readiness() != Readiness::Ready {
                        let err = TrialError::StartupTimeout {
                            component: handle.id().to_string(),
                            waited: self.settings.readiness_timeout,
                        };
                        run.fail(Some(handle.id()), err.to_string());
                    }
                }
                return false;
            }
            tokio::select! {
                biased;
                _ = stop.wait() => {
                    run.fail(None, "stopped before the trial started");
                    return false;
                }
                _ = sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// Open the recording window, supervise it, close it.  Returns the stop
    /// reason when the window closed normally.
    async fn run_window(
        &self,
        run: &mut Run,
        bus: &MessageBus,
        handles: &[ComponentHandle],
        events: &mut mpsc::UnboundedReceiver<ComponentEvent>,
        stop: &mut StopSignal,
        record_pub: Option<&Publisher>,
    ) -> Option<StopReason> {
        let clock = bus.clock();
        run.enter(TrialState::Running);
        let start_at = clock.now();
        broadcast(handles, ControlSignal::Start { at: start_at });
        publish_trigger(record_pub, Trigger::RecordStart).await;
        info!(?start_at, duration = ?self.settings.trial_duration, "recording window open");

        let mut watchdog = Watchdog::new();
        for handle in handles {
            watchdog.register(handle.id(), self.settings.heartbeat_timeout);
        }
        let window_end = sleep_until(clock.instant_at(start_at + self.settings.trial_duration));
        tokio::pin!(window_end);
        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    if let Some(end) = run.running_event(event, self.settings.abort_on_degraded) {
                        break end;
                    }
                }
                _ = stop.wait() => {
                    info!("external stop requested");
                    break RunEnd::Stop(StopReason::External);
                }
                _ = &mut window_end => break RunEnd::Stop(StopReason::DurationElapsed),
                _ = poll.tick() => {
                    if !supervise(run, handles, &mut watchdog) {
                        break RunEnd::Abort;
                    }
                }
            }
        };

        let stop_at = clock.now();
        let reason = match end {
            RunEnd::Stop(reason) => {
                run.enter(TrialState::Stopping);
                Some(reason)
            }
            RunEnd::Abort => None,
        };
        broadcast(handles, ControlSignal::Stop { at: stop_at });
        publish_trigger(record_pub, Trigger::RecordStop).await;
        info!(?stop_at, ?reason, "recording window closed");

        let recorder_alive = handles
            .iter()
            .any(|h| h.id() == RECORDER_ID && h.readiness() == Readiness::Ready);
        if !run.seal_settled && recorder_alive {
            self.await_seal(run, events, reason.is_some()).await;
        }
        // A normal stop needs the one recording of this trial.
        if reason.is_some() && run.sealed.is_none() && run.trail.is_empty() {
            let cause = handles
                .iter()
                .find(|h| h.id() == RECORDER_ID)
                .map(ComponentHandle::readiness);
            let why = match cause {
                Some(Readiness::Failed(error)) => format!("recording never sealed: {error}"),
                Some(Readiness::Stopped) => "recording never sealed: recorder exited".to_string(),
                _ => "recording never sealed".to_string(),
            };
            run.fail(Some(RECORDER_ID), why);
        }
        reason
    }

    /// Wait a bounded time for the recorder's `Sealed`.  When `strict`, a
    /// missing seal is a trial failure; otherwise it is only logged.
    async fn await_seal(
        &self,
        run: &mut Run,
        events: &mut mpsc::UnboundedReceiver<ComponentEvent>,
        strict: bool,
    ) {
        let deadline = sleep(self.settings.seal_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => match event.kind {
                    EventKind::Sealed { path, samples, .. } => {
                        run.sealed = Some(Sealed { path, samples });
                        run.seal_settled = true;
                        return;
                    }
                    EventKind::SealFailed { attempts, reason } => {
                        run.seal_settled = true;
                        let err = TrialError::SealPersistence { attempts, reason };
                        run.fail(Some(event.component.as_str()), err.to_string());
                        return;
                    }
                    other => {
                        debug!(component = %event.component, event = ?other, "event while sealing");
                    }
                },
                _ = &mut deadline => {
                    let reason =
                        format!("recording not sealed within {:?}", self.settings.seal_timeout);
                    if strict {
                        run.fail(Some(RECORDER_ID), reason);
                    } else {
                        warn!(%reason, "aborted trial left unsealed");
                    }
                    return;
                }
            }
        }
    }
}

fn broadcast(handles: &[ComponentHandle], signal: ControlSignal) {
    for handle in handles {
        if !handle.signal(signal) {
            debug!(component = handle.id(), ?signal, "control signal not delivered");
        }
    }
}

async fn publish_trigger(publisher: Option<&Publisher>, trigger: Trigger) {
    if let Some(publisher) = publisher {
        if let Err(e) = publisher.publish(Message::Trigger(trigger)).await {
            warn!(error = %e, ?trigger, "record trigger not published");
        }
    }
}

/// One supervision pass while `Running`.  Returns `false` if the trial must
/// abort.
fn supervise(run: &mut Run, handles: &[ComponentHandle], watchdog: &mut Watchdog) -> bool {
    let mut healthy = true;
    for handle in handles {
        match handle.readiness() {
            Readiness::Failed(reason) => {
                run.fail(Some(handle.id()), reason);
                healthy = false;
            }
            Readiness::Stopped => {
                run.fail(Some(handle.id()), "stopped while the trial was running");
                healthy = false;
            }
            Readiness::Ready | Readiness::Starting => {
                watchdog.observe(handle.id(), handle.last_heartbeat());
            }
        }
    }
    if !healthy {
        return false;
    }
    let stale = watchdog.stale();
    for (component, silent_for) in &stale {
        run.fail(Some(component.as_str()), format!("no heartbeat for {silent_for:?}"));
    }
    stale.is_empty()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentContext};
    use crate::storage::MemoryTrialStore;
    use async_trait::async_trait;

    /// Ready at once; heartbeats until shut down.
    struct Idle(&'static str);

    #[async_trait]
    impl Component for Idle {
        fn id(&self) -> &str {
            self.0
        }

        async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
            ctx.set_ready();
            let mut tick = interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    signal = ctx.recv_control() => if signal == ControlSignal::Shutdown {
                        return Ok(());
                    },
                    _ = tick.tick() => ctx.heartbeat(),
                }
            }
        }
    }

    /// Ready, then goes silent after `after`.
    struct Freezes(Duration);

    #[async_trait]
    impl Component for Freezes {
        fn id(&self) -> &str {
            "freezes"
        }

        async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
            ctx.set_ready();
            let until = Instant::now() + self.0;
            while Instant::now() < until {
                ctx.heartbeat();
                sleep(Duration::from_millis(100)).await;
            }
            pending::<()>().await;
            Ok(())
        }
    }

    /// Ready, then fails after `after`.
    struct Crashes(Duration);

    #[async_trait]
    impl Component for Crashes {
        fn id(&self) -> &str {
            "crashes"
        }

        async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
            ctx.set_ready();
            sleep(self.0).await;
            Err(TrialError::Hardware {
                device: "crashes".to_string(),
                details: "bus fault".to_string(),
            })
        }
    }

    /// Stands in for the trajectory recorder: seals on Stop without data.
    struct Seals;

    #[async_trait]
    impl Component for Seals {
        fn id(&self) -> &str {
            RECORDER_ID
        }

        async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
            ctx.set_ready();
            let mut tick = interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    signal = ctx.recv_control() => match signal {
                        ControlSignal::Stop { .. } => ctx.report(EventKind::Sealed {
                            path: PathBuf::from("memory"),
                            samples: 0,
                            reason: SealReason::Stopped,
                        }),
                        ControlSignal::Shutdown => return Ok(()),
                        _ => {}
                    },
                    _ = tick.tick() => ctx.heartbeat(),
                }
            }
        }
    }

    /// A recorder that dies `after` the window opened, before anything is sealed.
    struct RecorderDies(Duration);

    #[async_trait]
    impl Component for RecorderDies {
        fn id(&self) -> &str {
            RECORDER_ID
        }

        async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
            ctx.set_ready();
            while !matches!(ctx.recv_control().await, ControlSignal::Start { .. }) {}
            let until = Instant::now() + self.0;
            while Instant::now() < until {
                ctx.heartbeat();
                sleep(Duration::from_millis(5)).await;
            }
            Err(TrialError::Storage("disk vanished".to_string()))
        }
    }

    struct Fixed(fn() -> Vec<Box<dyn Component>>);

    impl TopologyFactory for Fixed {
        fn build(&self, _ctx: &TrialContext) -> Result<Vec<Box<dyn Component>>, TrialError> {
            Ok((self.0)())
        }
    }

    fn raw() -> RawTrialArgs {
        RawTrialArgs::new()
            .set("participant_id", "9")
            .set("autonomy_id", "3")
            .set("trajectory_id", "1")
    }

    fn orchestrator(
        topology: fn() -> Vec<Box<dyn Component>>,
        store: Arc<MemoryTrialStore>,
    ) -> TrialOrchestrator {
        let settings = TrialSettings {
            trial_duration: Duration::from_secs(2),
            ..TrialSettings::default()
        };
        TrialOrchestrator::new(settings, Arc::new(Fixed(topology)), store)
    }

    #[tokio::test(start_paused = true)]
    async fn nominal_window_completes() {
        let store = Arc::new(MemoryTrialStore::new());
        let report = orchestrator(
            || vec![Box::new(Idle("a")), Box::new(Idle("b")), Box::new(Seals)],
            Arc::clone(&store),
        )
        .run(&raw(), StopSignal::never())
        .await;

        assert!(report.is_complete(), "{:?}", report.trail);
        assert_eq!(
            report.states(),
            vec![
                TrialState::Resolving,
                TrialState::Launching,
                TrialState::AwaitingReady,
                TrialState::Running,
                TrialState::Stopping,
                TrialState::Complete,
            ]
        );
        assert_eq!(report.stop_reason, Some(StopReason::DurationElapsed));
        assert_eq!(report.recording, Some(PathBuf::from("memory")));
        // Reverse launch order.
        assert_eq!(
            report.shutdown,
            vec![
                (RECORDER_ID.to_string(), ShutdownAck::Acknowledged),
                ("b".to_string(), ShutdownAck::Acknowledged),
                ("a".to_string(), ShutdownAck::Acknowledged),
            ]
        );
        assert_eq!(store.outcomes().len(), 1);
        assert_eq!(store.outcomes()[0].final_state, TrialState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn topology_without_recorder_is_rejected() {
        let store = Arc::new(MemoryTrialStore::new());
        let report = orchestrator(|| vec![Box::new(Idle("a"))], Arc::clone(&store))
            .run(&raw(), StopSignal::never())
            .await;
        assert_eq!(report.final_state, TrialState::Aborted);
        assert_eq!(report.handles_created, 0);
        assert_eq!(report.trail[0].state, TrialState::Launching);
        assert!(report.trail[0].reason.contains(RECORDER_ID));
        assert!(!report.states().contains(&TrialState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_dying_just_before_the_window_ends_aborts() {
        let store = Arc::new(MemoryTrialStore::new());
        let report = orchestrator(
            || {
                vec![
                    Box::new(Idle("a")),
                    Box::new(RecorderDies(Duration::from_millis(1995))),
                ]
            },
            Arc::clone(&store),
        )
        .run(&raw(), StopSignal::never())
        .await;

        assert_eq!(report.final_state, TrialState::Aborted, "{:?}", report.trail);
        let entry = report
            .trail
            .iter()
            .find(|e| e.component.as_deref() == Some(RECORDER_ID))
            .expect("recorder named in the trail");
        assert!(entry.reason.contains("disk vanished"), "{}", entry.reason);
        assert_eq!(report.recording, None);
        assert_eq!(report.sample_count, 0);
        assert!(store.recordings().is_empty());
        assert_eq!(store.outcomes()[0].final_state, TrialState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_parameters_start_nothing() {
        let store = Arc::new(MemoryTrialStore::new());
        let raw = raw().set("autonomy_id", "7");
        let report = orchestrator(|| vec![Box::new(Idle("a"))], Arc::clone(&store))
            .run(&raw, StopSignal::never())
            .await;
        assert_eq!(report.final_state, TrialState::Aborted);
        assert_eq!(report.handles_created, 0);
        assert_eq!(report.states(), vec![TrialState::Resolving, TrialState::Aborted]);
        assert!(report.trail[0].reason.contains("autonomy_id"));
        assert!(store.outcomes().is_empty());
        assert!(matches!(report.into_result(), Err(TrialError::Aborted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn existing_output_is_a_duplicate() {
        let key = resolve(&raw()).unwrap().key();
        let store = Arc::new(MemoryTrialStore::new().with_existing(&key));
        let report = orchestrator(|| vec![Box::new(Idle("a"))], store)
            .run(&raw(), StopSignal::never())
            .await;
        assert_eq!(report.handles_created, 0);
        assert!(report.trail[0].reason.contains("part9_auto3_traj1"));
    }

    #[tokio::test(start_paused = true)]
    async fn external_stop_ends_normally() {
        let (trigger, signal) = stop_channel();
        let store = Arc::new(MemoryTrialStore::new());
        let orchestrator = orchestrator(|| vec![Box::new(Idle("a")), Box::new(Seals)], store);
        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            trigger.trigger();
        });
        let report = orchestrator.run(&raw(), signal).await;
        stopper.await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.stop_reason, Some(StopReason::External));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_aborts() {
        let (trigger, signal) = stop_channel();
        trigger.trigger();
        assert!(signal.is_triggered());
        let report = orchestrator(
            || vec![Box::new(Idle("a")), Box::new(Seals)],
            Arc::new(MemoryTrialStore::new()),
        )
        .run(&raw(), signal)
        .await;
        assert_eq!(report.final_state, TrialState::Aborted);
        assert_eq!(report.trail[0].state, TrialState::AwaitingReady);
        assert!(!report.states().contains(&TrialState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn component_failure_while_running_aborts() {
        let report = orchestrator(
            || {
                vec![
                    Box::new(Idle("a")),
                    Box::new(Crashes(Duration::from_millis(500))),
                    Box::new(Seals),
                ]
            },
            Arc::new(MemoryTrialStore::new()),
        )
        .run(&raw(), StopSignal::never())
        .await;
        assert_eq!(report.final_state, TrialState::Aborted);
        let entry = &report.trail[0];
        assert_eq!(entry.component.as_deref(), Some("crashes"));
        assert_eq!(entry.state, TrialState::Running);
        assert!(entry.reason.contains("bus fault"));
        assert!(!report.states().contains(&TrialState::Stopping));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_component_is_caught_by_the_watchdog() {
        let store = Arc::new(MemoryTrialStore::new());
        let settings = TrialSettings {
            trial_duration: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(1),
            ..TrialSettings::default()
        };
        let report = TrialOrchestrator::new(
            settings,
            Arc::new(Fixed(|| {
                vec![
                    Box::new(Idle("a")),
                    Box::new(Freezes(Duration::from_secs(2))),
                    Box::new(Seals),
                ]
            })),
            store,
        )
        .run(&raw(), StopSignal::never())
        .await;

        assert_eq!(report.final_state, TrialState::Aborted);
        assert_eq!(report.trail[0].component.as_deref(), Some("freezes"));
        assert!(report.trail[0].reason.contains("no heartbeat"));
        assert_eq!(report.shutdown_ack("freezes"), Some(ShutdownAck::Forced));
        assert_eq!(report.shutdown_ack("a"), Some(ShutdownAck::Acknowledged));
    }
}
