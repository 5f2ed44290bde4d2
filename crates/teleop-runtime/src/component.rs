//! Component framework.
//!
//! Every trial component is a [`Component`] run on its own Tokio task.  The
//! orchestrator talks to it through a [`ComponentHandle`] over three
//! channels that never mix with bus data:
//!
//! | Channel | Direction | Carries |
//! |---|---|---|
//! | control (`mpsc`) | orchestrator → component | [`ControlSignal`] |
//! | status (`watch`) | component → orchestrator | [`Readiness`] + last heartbeat |
//! | events (`mpsc`, shared) | component → orchestrator | [`ComponentEvent`] |
//!
//! When `run` returns the handle's readiness becomes [`Readiness::Stopped`]
//! (on `Ok`) or [`Readiness::Failed`] (on `Err`), so a component can never
//! disappear without the orchestrator noticing.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use teleop_middleware::MessageBus;
use teleop_types::TrialError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

use crate::recorder::SealReason;

const CONTROL_CAPACITY: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Signals, status and events
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Starting,
    Ready,
    Failed(String),
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentStatus {
    pub readiness: Readiness,
    pub last_heartbeat: Instant,
}

/// Lifecycle commands.  `at` values are bus-clock instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Every component is ready; prepare for Start.
    Arm,
    /// The recording window opens at `at`.
    Start { at: Duration },
    /// The recording window closes at `at`.
    Stop { at: Duration },
    /// Release resources and return from `run`.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// The input device failed this many reads in a row.
    Degraded { consecutive_failures: u32 },
    /// The input device is delivering again.
    Recovered,
    /// A replayed recording reached its end.
    ReplayFinished { messages: u64 },
    /// The trial recording was sealed and persisted.
    Sealed {
        path: PathBuf,
        samples: usize,
        reason: SealReason,
    },
    /// The trial recording could not be persisted.
    SealFailed { attempts: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentEvent {
    pub component: String,
    pub kind: EventKind,
}

// ────────────────────────────────────────────────────────────────────────────
// Component trait and context
// ────────────────────────────────────────────────────────────────────────────

/// A trial component.
///
/// `run` must call [`ComponentContext::set_ready`] once it can do its job,
/// heartbeat while running, and return promptly after
/// [`ControlSignal::Shutdown`].
#[async_trait]
pub trait Component: Send {
    fn id(&self) -> &str;

    async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError>;
}

/// A component's side of its channels.
pub struct ComponentContext {
    id: String,
    bus: MessageBus,
    control: mpsc::Receiver<ControlSignal>,
    status: watch::Sender<ComponentStatus>,
    events: mpsc::UnboundedSender<ComponentEvent>,
}

impl ComponentContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn set_ready(&self) {
        debug!(component = %self.id, "ready");
        self.status.send_modify(|s| {
            s.readiness = Readiness::Ready;
            s.last_heartbeat = Instant::now();
        });
    }

    pub fn heartbeat(&self) {
        self.status
            .send_modify(|s| s.last_heartbeat = Instant::now());
    }

    /// Send an event to the orchestrator.  Dropped if nobody listens.
    pub fn report(&self, kind: EventKind) {
        let _ = self.events.send(ComponentEvent {
            component: self.id.clone(),
            kind,
        });
    }

    /// Next control signal.  A closed control channel reads as
    /// [`ControlSignal::Shutdown`].
    pub async fn recv_control(&mut self) -> ControlSignal {
        self.control.recv().await.unwrap_or(ControlSignal::Shutdown)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

/// How a component ended during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ShutdownAck {
    /// Returned from `run` within the grace period.
    Acknowledged,
    /// Did not return in time and was aborted.
    Forced,
}

/// The orchestrator's view of a running component.
pub struct ComponentHandle {
    id: String,
    status: watch::Receiver<ComponentStatus>,
    control: mpsc::Sender<ControlSignal>,
    task: JoinHandle<()>,
}

impl ComponentHandle {
    /// Start `component` on its own task.
    pub fn spawn(
        component: Box<dyn Component>,
        bus: MessageBus,
        events: mpsc::UnboundedSender<ComponentEvent>,
    ) -> Self {
        let id = component.id().to_string();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ComponentStatus {
            readiness: Readiness::Starting,
            last_heartbeat: Instant::now(),
        });
        let mut ctx = ComponentContext {
            id: id.clone(),
            bus,
            control: control_rx,
            status: status_tx,
            events,
        };

        let span = info_span!("component", id = %id);
        let task = tokio::spawn(
            async move {
                let outcome = component.run(&mut ctx).await;
                let readiness = match outcome {
                    Ok(()) => Readiness::Stopped,
                    Err(e) => {
                        warn!(error = %e, "component failed");
                        Readiness::Failed(e.to_string())
                    }
                };
                ctx.status.send_modify(|s| s.readiness = readiness);
            }
            .instrument(span),
        );

        Self {
            id,
            status: status_rx,
            control: control_tx,
            task,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn readiness(&self) -> Readiness {
        self.status.borrow().readiness.clone()
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.status.borrow().last_heartbeat
    }

    /// Queue a control signal.  Returns `false` when the component is gone
    /// or its control queue is full.
    pub fn signal(&self, signal: ControlSignal) -> bool {
        self.control.try_send(signal).is_ok()
    }

    /// Ask the component to shut down and wait up to `grace` for it to
    /// return; abort it otherwise.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownAck {
        self.signal(ControlSignal::Shutdown);
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => ShutdownAck::Acknowledged,
            Err(_) => {
                warn!(component = %self.id, ?grace, "no shutdown acknowledgement; aborting");
                self.task.abort();
                ShutdownAck::Forced
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
