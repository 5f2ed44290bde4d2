//! Sensor stream replayer.
//!
//! Plays a pre-recorded sensor log back onto the bus with the same topics
//! and schemas as live input, so everything downstream is unaware of the
//! difference.
//!
//! A log is JSON Lines, one [`ReplayEntry`] per line:
//!
//! ```text
//! {"offset":{"secs":0,"nanos":10000000},"topic":"falcon_position","message":{"schema":"Pose","data":{...}}}
//! ```
//!
//! Offsets are relative to the start of the log and must not decrease.
//! Playback is aligned to the trial's Start instant and keeps the original
//! spacing 1:1; every pose and marker set is re-stamped with the bus time it
//! is published at.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use teleop_middleware::{BusClock, Publisher, Topic, topics};
use teleop_types::{Message, PoseSource, TrialError};
use tokio::time::{MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info};

use crate::component::{Component, ComponentContext, ControlSignal, EventKind};
use crate::recorder::TrialRecording;

pub const REPLAYER_ID: &str = "sensor_replayer";

const HEARTBEAT_PERIOD: Duration = Duration::from_millis(250);

/// One line of a sensor log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub offset: Duration,
    pub topic: String,
    pub message: Message,
}

/// A validated sensor log.
#[derive(Debug, Clone, Default)]
pub struct ReplayLog {
    entries: Vec<(Topic, ReplayEntry)>,
}

impl ReplayLog {
    /// Read and validate a JSON Lines log.  Blank lines are skipped.
    pub fn load(path: &Path) -> Result<Self, TrialError> {
        let file = File::open(path)
            .map_err(|e| TrialError::Replay(format!("{}: {e}", path.display())))?;
        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| TrialError::Replay(format!("{}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(&line).map_err(|e| {
                TrialError::Replay(format!("{} line {}: {e}", path.display(), index + 1))
            })?;
            entries.push(entry);
        }
        let log = Self::from_entries(entries)?;
        debug!(
            path = %path.display(),
            entries = log.len(),
            duration = ?log.duration(),
            "sensor log loaded"
        );
        Ok(log)
    }

    /// Validate entries: known topic, matching schema, non-decreasing offset.
    pub fn from_entries(entries: Vec<ReplayEntry>) -> Result<Self, TrialError> {
        let mut last = Duration::ZERO;
        let mut validated = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let topic = topics::by_name(&entry.topic).ok_or_else(|| {
                TrialError::Replay(format!("entry {index}: unknown topic `{}`", entry.topic))
            })?;
            let found = entry.message.schema();
            if found != topic.schema {
                return Err(TrialError::Replay(format!(
                    "entry {index}: topic `{}` carries {:?}, got {found:?}",
                    topic.name, topic.schema
                )));
            }
            if entry.offset < last {
                return Err(TrialError::Replay(format!(
                    "entry {index}: offset {:?} before previous {last:?}",
                    entry.offset
                )));
            }
            last = entry.offset;
            validated.push((topic, entry));
        }
        Ok(Self { entries: validated })
    }

    /// Turn a sealed recording back into a sensor log: device samples on
    /// `falcon_position`, robot samples on `robot_target_pose`.
    pub fn from_recording(recording: &TrialRecording) -> Self {
        let entries = recording
            .samples
            .iter()
            .map(|sample| {
                let topic = match sample.source {
                    PoseSource::Device => topics::DEVICE_POSE,
                    PoseSource::Robot => topics::ROBOT_TARGET,
                };
                (
                    topic,
                    ReplayEntry {
                        offset: sample.timestamp,
                        topic: topic.name.to_string(),
                        message: Message::Pose(sample.clone()),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Write the log as JSON Lines.
    pub fn write(&self, path: &Path) -> Result<(), TrialError> {
        let io_error = |e: std::io::Error| TrialError::Replay(format!("{}: {e}", path.display()));
        let mut out = BufWriter::new(File::create(path).map_err(io_error)?);
        for (_, entry) in &self.entries {
            serde_json::to_writer(&mut out, entry)
                .map_err(|e| TrialError::Replay(format!("{}: {e}", path.display())))?;
            out.write_all(b"\n").map_err(io_error)?;
        }
        out.flush().map_err(io_error)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of the last entry.
    pub fn duration(&self) -> Duration {
        self.entries.last().map_or(Duration::ZERO, |(_, e)| e.offset)
    }

    /// Distinct topics in first-appearance order.
    pub fn topics(&self) -> Vec<Topic> {
        let mut seen = Vec::new();
        for (topic, _) in &self.entries {
            if !seen.contains(topic) {
                seen.push(*topic);
            }
        }
        seen
    }

    /// Play the log against `clock`, entry `i` at `start_at + offset_i`.
    pub fn replay(
        self,
        clock: BusClock,
        start_at: Duration,
    ) -> BoxStream<'static, (Topic, Message)> {
        stream::unfold(self.entries.into_iter(), move |mut entries| async move {
            let (topic, entry) = entries.next()?;
            let at = start_at + entry.offset;
            sleep_until(clock.instant_at(at)).await;
            Some(((topic, restamp(entry.message, at)), entries))
        })
        .boxed()
    }
}

/// Load `path` and play it back from `start_at`.
pub fn replay(
    path: &Path,
    clock: BusClock,
    start_at: Duration,
) -> Result<BoxStream<'static, (Topic, Message)>, TrialError> {
    Ok(ReplayLog::load(path)?.replay(clock, start_at))
}

fn restamp(message: Message, at: Duration) -> Message {
    match message {
        Message::Pose(mut sample) => {
            sample.timestamp = at;
            Message::Pose(sample)
        }
        Message::Markers(mut set) => {
            set.stamp = at;
            Message::Markers(set)
        }
        other => other,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Component
// ────────────────────────────────────────────────────────────────────────────

/// Stands in for the input publisher when a trial runs from a sensor log.
pub struct SensorReplayer {
    path: PathBuf,
}

impl SensorReplayer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Component for SensorReplayer {
    fn id(&self) -> &str {
        REPLAYER_ID
    }

    async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
        let log = ReplayLog::load(&self.path)?;
        let mut publishers: HashMap<&'static str, Publisher> = HashMap::new();
        for topic in log.topics() {
            publishers.insert(topic.name, ctx.bus().advertise(&topic, REPLAYER_ID)?);
        }
        let clock = ctx.bus().clock();
        let mut heartbeat = interval(HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            path = %self.path.display(),
            entries = log.len(),
            duration = ?log.duration(),
            "replayer ready"
        );
        ctx.set_ready();

        let start_at = loop {
            tokio::select! {
                biased;
                signal = ctx.recv_control() => match signal {
                    ControlSignal::Start { at } => break at,
                    ControlSignal::Shutdown => return Ok(()),
                    ControlSignal::Arm | ControlSignal::Stop { .. } => {}
                },
                _ = heartbeat.tick() => ctx.heartbeat(),
            }
        };

        let mut playback = log.replay(clock, start_at);
        let mut playing = true;
        let mut published: u64 = 0;
        loop {
            tokio::select! {
                biased;
                signal = ctx.recv_control() => match signal {
                    ControlSignal::Stop { .. } => {
                        if playing {
                            debug!(published, "playback stopped early");
                        }
                        playing = false;
                    }
                    ControlSignal::Shutdown => return Ok(()),
                    ControlSignal::Arm | ControlSignal::Start { .. } => {}
                },
                item = playback.next(), if playing => match item {
                    Some((topic, message)) => {
                        if let Some(publisher) = publishers.get(topic.name) {
                            publisher.publish(message).await?;
                            published += 1;
                        }
                    }
                    None => {
                        playing = false;
                        info!(published, "replay finished");
                        ctx.report(EventKind::ReplayFinished { messages: published });
                    }
                },
                _ = heartbeat.tick() => ctx.heartbeat(),
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentHandle, Readiness};
    use teleop_middleware::{MessageBus, QueuePolicy};
    use teleop_types::{PoseSample, Quaternion, Trigger, Vec3};
    use tokio::sync::mpsc;

    fn pose_entries(count: u64, spacing: Duration) -> Vec<ReplayEntry> {
        let mut entries = Vec::new();
        for seq in 0..count {
            let offset = spacing * seq as u32;
            entries.push(ReplayEntry {
                offset,
                topic: "falcon_position".to_string(),
                message: Message::Pose(PoseSample::device(
                    seq,
                    offset,
                    Vec3::new(0.0, 0.0, 0.01 * seq as f64),
                    Quaternion::identity(),
                )),
            });
            entries.push(ReplayEntry {
                offset,
                topic: "robot_target_pose".to_string(),
                message: Message::Pose(PoseSample::robot(
                    seq,
                    offset,
                    Vec3::new(0.4559, 0.0, 0.3846),
                    Quaternion::identity(),
                    seq,
                )),
            });
        }
        entries
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let err = ReplayLog::from_entries(vec![ReplayEntry {
            offset: Duration::ZERO,
            topic: "joint_states".to_string(),
            message: Message::Trigger(Trigger::RecordStart),
        }])
        .unwrap_err();
        assert!(err.to_string().contains("joint_states"));
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let err = ReplayLog::from_entries(vec![ReplayEntry {
            offset: Duration::ZERO,
            topic: "falcon_position".to_string(),
            message: Message::Trigger(Trigger::RecordStart),
        }])
        .unwrap_err();
        assert!(matches!(err, TrialError::Replay(_)));
    }

    #[test]
    fn decreasing_offsets_are_rejected() {
        let mut entries = pose_entries(3, Duration::from_millis(10));
        entries.swap(0, 5);
        assert!(ReplayLog::from_entries(entries).is_err());
    }

    #[test]
    fn log_roundtrips_through_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let log = ReplayLog::from_entries(pose_entries(4, Duration::from_millis(10))).unwrap();
        log.write(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 8);

        let back = ReplayLog::load(&path).unwrap();
        assert_eq!(back.len(), 8);
        assert_eq!(back.duration(), Duration::from_millis(30));
        assert_eq!(back.topics(), vec![topics::DEVICE_POSE, topics::ROBOT_TARGET]);
    }

    #[test]
    fn malformed_line_names_its_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "\n{ nope\n").unwrap();
        let err = ReplayLog::load(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn playback_keeps_original_spacing() {
        let clock = BusClock::new();
        let log = ReplayLog::from_entries(pose_entries(5, Duration::from_millis(100))).unwrap();
        let start_at = Duration::from_secs(1);
        let mut stream = log.replay(clock, start_at);

        let mut device_times = Vec::new();
        while let Some((topic, message)) = stream.next().await {
            let Message::Pose(sample) = message else {
                panic!("only poses in this log");
            };
            assert!(clock.now() >= sample.timestamp);
            if topic == topics::DEVICE_POSE {
                device_times.push(sample.timestamp);
            }
        }
        let expected: Vec<_> = (0..5).map(|i| start_at + Duration::from_millis(100 * i)).collect();
        assert_eq!(device_times, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn component_waits_for_start_then_reports_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        ReplayLog::from_entries(pose_entries(10, Duration::from_millis(50)))
            .unwrap()
            .write(&path)
            .unwrap();

        let bus = MessageBus::default();
        let mut device = bus.subscribe(&topics::DEVICE_POSE, QueuePolicy::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ComponentHandle::spawn(Box::new(SensorReplayer::new(&path)), bus.clone(), tx);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.readiness(), Readiness::Ready);
        assert!(device.try_recv().is_none());

        handle.signal(ControlSignal::Start { at: bus.clock().now() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ReplayFinished { messages: 20 });

        let mut received = 0;
        while device.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 10);
        assert_eq!(
            handle.shutdown(Duration::from_secs(1)).await,
            crate::component::ShutdownAck::Acknowledged
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_log_fails_the_component() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ComponentHandle::spawn(
            Box::new(SensorReplayer::new("/nonexistent/session.jsonl")),
            MessageBus::default(),
            tx,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(handle.readiness(), Readiness::Failed(_)));
    }
}
