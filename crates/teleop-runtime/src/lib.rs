//! `teleop-runtime` – trial components and the orchestrator that runs them.
//!
//! Each trial component is an async task talking to its peers only through
//! the `teleop-middleware` bus, and to the orchestrator only through its
//! control, status and event channels.
//!
//! # Modules
//!
//! | Module | Provides |
//! |---|---|
//! | [`component`] | [`Component`] trait, [`ComponentHandle`], control signals and events |
//! | [`input_publisher`] | haptic device → `falcon_position` + `robot_target_pose` |
//! | [`replayer`] | sensor log → the same topics, aligned to Start |
//! | [`marker_publisher`] | `visualization_marker_array` for the passive viewer |
//! | [`frame_broadcaster`] | static calibration transforms on `tf_static` |
//! | [`recorder`] | the trial recording state machine and its component |
//! | [`storage`] | [`TrialStore`] with file and in-memory backends |
//! | [`topology`] | which components a trial runs, in launch order |
//! | [`orchestrator`] | [`TrialOrchestrator`]: the trial lifecycle |
//! | [`settings`] | [`TrialSettings`] timing and policy knobs |
//! | [`telemetry`] | [`init_tracing`]: `tracing` subscriber with optional OTLP export |
//!
//! # Running a trial
//!
//! ```no_run
//! use std::sync::Arc;
//! use teleop_hal::SimDeviceFactory;
//! use teleop_kernel::RawTrialArgs;
//! use teleop_runtime::{
//!     FileTrialStore, InputSource, StandardTopology, StopSignal, TrialOrchestrator, TrialSettings,
//! };
//!
//! # async fn demo() -> Result<(), teleop_types::TrialError> {
//! let store = Arc::new(FileTrialStore::new("trials")?);
//! let topology = Arc::new(StandardTopology::new(InputSource::Device(Arc::new(
//!     SimDeviceFactory::default(),
//! ))));
//! let orchestrator = TrialOrchestrator::new(TrialSettings::default(), topology, store);
//! let raw = RawTrialArgs::new()
//!     .set("participant_id", "1")
//!     .set("autonomy_id", "2")
//!     .set("trajectory_id", "3");
//! let report = orchestrator.run(&raw, StopSignal::never()).await.into_result()?;
//! println!("{} samples in {:?}", report.sample_count, report.recording);
//! # Ok(())
//! # }
//! ```

pub mod component;
pub mod frame_broadcaster;
pub mod input_publisher;
pub mod marker_publisher;
pub mod orchestrator;
pub mod recorder;
pub mod replayer;
pub mod settings;
pub mod storage;
pub mod telemetry;
pub mod topology;

pub use component::{
    Component, ComponentContext, ComponentEvent, ComponentHandle, ControlSignal, EventKind,
    Readiness, ShutdownAck,
};
pub use orchestrator::{
    StopReason, StopSignal, StopTrigger, TrialOrchestrator, TrialOutcome, TrialReport,
    stop_channel,
};
pub use recorder::{SealReason, TrajectoryRecorder, TrialRecording};
pub use replayer::{ReplayEntry, ReplayLog, replay};
pub use settings::TrialSettings;
pub use storage::{FileTrialStore, MemoryTrialStore, TrialStore, load_recording};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use topology::{InputSource, StandardTopology, TopologyFactory, TrialContext};
