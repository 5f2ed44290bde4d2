//! End-to-end trial runs on virtual time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teleop_hal::{SimDeviceConfig, SimDeviceFactory};
use teleop_kernel::RawTrialArgs;
use teleop_perception::WORKSPACE_ORIGIN;
use teleop_runtime::frame_broadcaster::FrameBroadcaster;
use teleop_runtime::input_publisher::{INPUT_PUBLISHER_ID, InputPublisher};
use teleop_runtime::marker_publisher::MARKER_PUBLISHER_ID;
use teleop_runtime::recorder::{RECORDER_ID, RecorderComponent};
use teleop_runtime::{
    Component, ComponentContext, ControlSignal, FileTrialStore, InputSource, MemoryTrialStore,
    ReplayEntry, ReplayLog, ShutdownAck, StandardTopology, StopReason, StopSignal,
    TopologyFactory, TrialContext, TrialOrchestrator, TrialSettings, TrialStore, load_recording,
};
use teleop_types::{Message, PoseSample, Quaternion, TrialError, TrialState, Vec3};

fn raw(participant: u32, autonomy: u8, trajectory: u8) -> RawTrialArgs {
    RawTrialArgs::new()
        .set("participant_id", participant.to_string())
        .set("autonomy_id", autonomy.to_string())
        .set("trajectory_id", trajectory.to_string())
}

fn sim_topology() -> Arc<StandardTopology> {
    Arc::new(StandardTopology::new(InputSource::Device(Arc::new(
        SimDeviceFactory::default(),
    ))))
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

// ── A: nominal trial ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn nominal_trial_produces_one_complete_recording() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTrialStore::new(dir.path()).unwrap());
    let orchestrator = TrialOrchestrator::new(TrialSettings::default(), sim_topology(), store);

    let args = raw(1, 2, 3)
        .set("mapping_ratio", "0.5")
        .set("use_depth", "false");
    let report = orchestrator.run(&args, StopSignal::never()).await;

    assert!(report.is_complete(), "trail: {:?}", report.trail);
    assert_eq!(report.stop_reason, Some(StopReason::DurationElapsed));
    assert_eq!(report.handles_created, 4);
    assert!(report.shutdown.iter().all(|(_, ack)| *ack == ShutdownAck::Acknowledged));
    assert_eq!(
        files_in(dir.path()),
        vec!["part1_auto2_traj3.json", "part1_auto2_traj3.outcome.json"]
    );

    let path = report.recording.clone().unwrap();
    assert_eq!(path, dir.path().join("part1_auto2_traj3.json"));
    let recording = load_recording(&path).unwrap();
    assert_eq!(recording.run_id, report.run_id);
    assert_eq!(recording.key.to_string(), "part1_auto2_traj3");
    assert_eq!(recording.parameters.mapping_ratio(), 0.5);
    assert!(!recording.parameters.use_depth());
    assert_eq!(recording.samples.len(), report.sample_count);

    // 10 s at 100 Hz, both sides of the loop.
    let device: Vec<_> = recording.device_samples().collect();
    let robot: Vec<_> = recording.robot_samples().collect();
    assert!((990..=1001).contains(&device.len()), "{} device samples", device.len());
    assert_eq!(device.len(), robot.len());
    assert!(recording.samples.iter().all(|s| s.timestamp <= recording.duration));
    assert!(recording.duration >= Duration::from_secs(10));
    assert!(recording.duration < Duration::from_millis(10_100));

    // Each robot target is its device sample mapped around the workspace origin.
    for r in &robot {
        let d = device.iter().find(|d| Some(d.seq) == r.cause).unwrap();
        let expected = WORKSPACE_ORIGIN.add(d.position.scale(0.5));
        assert!(expected.distance(r.position) < 1e-9);
        assert_eq!(r.timestamp, d.timestamp);
    }
    assert_eq!(recording.counters.orphaned, 0);
}

// ── B: a component never becomes ready ──────────────────────────────────────

/// Registers under the marker publisher's id, never reports ready and
/// ignores every control signal.
struct StalledMarkers;

#[async_trait]
impl Component for StalledMarkers {
    fn id(&self) -> &str {
        MARKER_PUBLISHER_ID
    }

    async fn run(self: Box<Self>, _ctx: &mut ComponentContext) -> Result<(), TrialError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct StalledMarkerTopology;

impl TopologyFactory for StalledMarkerTopology {
    fn build(&self, ctx: &TrialContext) -> Result<Vec<Box<dyn Component>>, TrialError> {
        Ok(vec![
            Box::new(FrameBroadcaster::new(&ctx.settings)),
            Box::new(InputPublisher::new(
                Arc::clone(&ctx.params),
                Arc::new(SimDeviceFactory::default()),
                &ctx.settings,
            )),
            Box::new(StalledMarkers),
            Box::new(RecorderComponent::new(
                ctx.run_id,
                Arc::clone(&ctx.params),
                Arc::clone(&ctx.store),
                &ctx.settings,
            )),
        ])
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_component_aborts_without_recording() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTrialStore::new(dir.path()).unwrap());
    let orchestrator = TrialOrchestrator::new(
        TrialSettings::default(),
        Arc::new(StalledMarkerTopology),
        store,
    );
    let report = orchestrator.run(&raw(1, 2, 3), StopSignal::never()).await;

    assert_eq!(report.final_state, TrialState::Aborted);
    assert_eq!(report.trail.len(), 1);
    let entry = &report.trail[0];
    assert_eq!(entry.component.as_deref(), Some(MARKER_PUBLISHER_ID));
    assert_eq!(entry.state, TrialState::AwaitingReady);
    assert!(entry.reason.contains("not ready"));

    assert_eq!(report.shutdown_ack(INPUT_PUBLISHER_ID), Some(ShutdownAck::Acknowledged));
    assert_eq!(report.shutdown_ack(MARKER_PUBLISHER_ID), Some(ShutdownAck::Forced));
    assert_eq!(report.shutdown_ack(RECORDER_ID), Some(ShutdownAck::Acknowledged));
    assert!(!report.states().contains(&TrialState::Running));

    for name in [
        "part1_auto2_traj3.json",
        "part1_auto2_traj3.aborted.json",
        "part1_auto2_traj3.pending.json",
    ] {
        assert!(!dir.path().join(name).exists(), "{name} must not exist");
    }
    assert!(matches!(report.into_result(), Err(TrialError::Aborted { .. })));
}

// ── C: replayed sensor log ───────────────────────────────────────────────────

fn write_sensor_log(path: &Path, seconds: u64) {
    let mut entries = Vec::new();
    for seq in 0..=seconds * 100 {
        let offset = Duration::from_millis(seq * 10);
        let device = Vec3::new(0.01, 0.0, (seq as f64) * 1e-4);
        entries.push(ReplayEntry {
            offset,
            topic: "falcon_position".to_string(),
            message: Message::Pose(PoseSample::device(seq, offset, device, Quaternion::identity())),
        });
        entries.push(ReplayEntry {
            offset,
            topic: "robot_target_pose".to_string(),
            message: Message::Pose(PoseSample::robot(
                seq,
                offset,
                WORKSPACE_ORIGIN.add(device.scale(3.0)),
                Quaternion::new(0.0, 1.0, 0.0, 0.0),
                seq,
            )),
        });
    }
    ReplayLog::from_entries(entries).unwrap().write(path).unwrap();
}

#[tokio::test(start_paused = true)]
async fn replay_ends_the_trial_when_the_log_runs_out() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("session.jsonl");
    write_sensor_log(&log, 10);
    let out = dir.path().join("out");

    let settings = TrialSettings {
        trial_duration: Duration::from_secs(60),
        ..TrialSettings::default()
    };
    let store = Arc::new(FileTrialStore::new(&out).unwrap());
    let orchestrator = TrialOrchestrator::new(
        settings,
        Arc::new(StandardTopology::new(InputSource::Replay(log))),
        store,
    );
    let report = orchestrator.run(&raw(2, 5, 0), StopSignal::never()).await;

    assert!(report.is_complete(), "trail: {:?}", report.trail);
    assert_eq!(report.stop_reason, Some(StopReason::ReplayFinished));
    assert_eq!(report.sample_count, 2 * 1001);

    let recording = load_recording(&out.join("part2_auto5_traj0.json")).unwrap();
    assert!(recording.duration >= Duration::from_secs(10));
    assert!(recording.duration < Duration::from_secs(11));
    assert_eq!(recording.samples.first().map(|s| s.timestamp), Some(Duration::ZERO));
}

// ── Failure handling ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn invalid_parameters_launch_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTrialStore::new(dir.path()).unwrap());
    let orchestrator = TrialOrchestrator::new(TrialSettings::default(), sim_topology(), store);

    let report = orchestrator
        .run(&raw(1, 2, 3).set("mapping_ratio", "-1"), StopSignal::never())
        .await;
    assert_eq!(report.final_state, TrialState::Aborted);
    assert_eq!(report.handles_created, 0);
    assert!(report.shutdown.is_empty());
    assert!(files_in(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn completed_trial_cannot_be_repeated() {
    let dir = tempfile::tempdir().unwrap();
    let settings = TrialSettings {
        trial_duration: Duration::from_secs(1),
        ..TrialSettings::default()
    };
    let store: Arc<dyn TrialStore> = Arc::new(FileTrialStore::new(dir.path()).unwrap());
    let orchestrator = TrialOrchestrator::new(settings.clone(), sim_topology(), Arc::clone(&store));
    assert!(orchestrator.run(&raw(3, 1, 1), StopSignal::never()).await.is_complete());

    let again = orchestrator.run(&raw(3, 1, 1), StopSignal::never()).await;
    assert_eq!(again.handles_created, 0);
    assert!(again.trail[0].reason.contains("already exists"));

    let overwrite = TrialOrchestrator::new(
        TrialSettings {
            overwrite: true,
            ..settings
        },
        sim_topology(),
        store,
    );
    assert!(overwrite.run(&raw(3, 1, 1), StopSignal::never()).await.is_complete());
}

#[tokio::test(start_paused = true)]
async fn transient_seal_failures_are_retried() {
    let settings = TrialSettings {
        trial_duration: Duration::from_secs(1),
        ..TrialSettings::default()
    };
    let store = Arc::new(MemoryTrialStore::failing(2));
    let shared = Arc::clone(&store) as Arc<dyn TrialStore>;
    let report = TrialOrchestrator::new(settings, sim_topology(), shared)
        .run(&raw(1, 0, 0), StopSignal::never())
        .await;

    assert!(report.is_complete(), "trail: {:?}", report.trail);
    assert_eq!(store.persist_calls(), 3);
    assert_eq!(store.recordings().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn persistent_seal_failure_aborts() {
    let settings = TrialSettings {
        trial_duration: Duration::from_secs(1),
        ..TrialSettings::default()
    };
    let store = Arc::new(MemoryTrialStore::failing(3));
    let shared = Arc::clone(&store) as Arc<dyn TrialStore>;
    let report = TrialOrchestrator::new(settings, sim_topology(), shared)
        .run(&raw(1, 0, 0), StopSignal::never())
        .await;

    assert_eq!(report.final_state, TrialState::Aborted);
    let entry = &report.trail[0];
    assert_eq!(entry.component.as_deref(), Some(RECORDER_ID));
    assert_eq!(entry.state, TrialState::Stopping);
    assert!(entry.reason.contains("could not be persisted after 3 attempts"));
    assert!(store.recordings().is_empty());
    assert_eq!(store.outcomes()[0].final_state, TrialState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn degraded_input_aborts_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let settings = TrialSettings {
        degraded_threshold: 10,
        abort_on_degraded: true,
        ..TrialSettings::default()
    };
    let device = SimDeviceFactory::new(SimDeviceConfig {
        dropout: Some(50..10_000),
        ..SimDeviceConfig::default()
    });
    let store = Arc::new(FileTrialStore::new(dir.path()).unwrap());
    let report = TrialOrchestrator::new(
        settings,
        Arc::new(StandardTopology::new(InputSource::Device(Arc::new(device)))),
        store,
    )
    .run(&raw(4, 4, 4), StopSignal::never())
    .await;

    assert_eq!(report.final_state, TrialState::Aborted);
    let entry = &report.trail[0];
    assert_eq!(entry.component.as_deref(), Some(INPUT_PUBLISHER_ID));
    assert_eq!(entry.state, TrialState::Running);
    assert!(entry.reason.contains("degraded"));

    // What was recorded before the abort is kept, marked as aborted.
    assert!(dir.path().join("part4_auto4_traj4.aborted.json").exists());
    assert!(!dir.path().join("part4_auto4_traj4.json").exists());
    assert_eq!(report.recording, Some(dir.path().join("part4_auto4_traj4.aborted.json")));
}

#[tokio::test(start_paused = true)]
async fn degraded_input_is_tolerated_by_default() {
    let settings = TrialSettings {
        trial_duration: Duration::from_secs(2),
        degraded_threshold: 10,
        ..TrialSettings::default()
    };
    let device = SimDeviceFactory::new(SimDeviceConfig {
        dropout: Some(50..100),
        ..SimDeviceConfig::default()
    });
    let store = Arc::new(MemoryTrialStore::new());
    let report = TrialOrchestrator::new(
        settings,
        Arc::new(StandardTopology::new(InputSource::Device(Arc::new(device)))),
        Arc::clone(&store) as Arc<dyn TrialStore>,
    )
    .run(&raw(4, 4, 4), StopSignal::never())
    .await;

    assert!(report.is_complete(), "trail: {:?}", report.trail);
    // The 50 failed reads left a gap in the recording.
    let recording = &store.recordings()[0];
    assert!(recording.device_samples().count() < 200);
}

#[tokio::test(start_paused = true)]
async fn stop_without_start_persists_nothing() {
    // A recorder that never saw Start seals empty-handed.
    let store = Arc::new(MemoryTrialStore::new());
    let params = Arc::new(teleop_kernel::resolve(&raw(1, 1, 1)).unwrap());
    let recorder = RecorderComponent::new(
        uuid::Uuid::new_v4(),
        params,
        Arc::clone(&store) as Arc<dyn TrialStore>,
        &TrialSettings::default(),
    );
    let bus = teleop_middleware::MessageBus::default();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = teleop_runtime::ComponentHandle::spawn(Box::new(recorder), bus.clone(), tx);
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.signal(ControlSignal::Stop { at: bus.clock().now() });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.recordings().is_empty());
    assert_eq!(handle.shutdown(Duration::from_secs(1)).await, ShutdownAck::Acknowledged);
}
