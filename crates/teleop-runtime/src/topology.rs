//! Trial topology: which components a trial runs, in launch order.

use std::path::PathBuf;
use std::sync::Arc;

use teleop_hal::DeviceFactory;
use teleop_kernel::TrialParameters;
use teleop_types::TrialError;
use uuid::Uuid;

use crate::component::Component;
use crate::frame_broadcaster::FrameBroadcaster;
use crate::input_publisher::InputPublisher;
use crate::marker_publisher::MarkerPublisher;
use crate::recorder::RecorderComponent;
use crate::replayer::SensorReplayer;
use crate::settings::TrialSettings;
use crate::storage::TrialStore;

/// Everything a factory may need to build one trial's components.
#[derive(Clone)]
pub struct TrialContext {
    pub run_id: Uuid,
    pub params: Arc<TrialParameters>,
    pub settings: TrialSettings,
    pub store: Arc<dyn TrialStore>,
}

/// Builds the components of a trial.  The returned order is the launch
/// order; shutdown runs in reverse.
pub trait TopologyFactory: Send + Sync {
    fn build(&self, ctx: &TrialContext) -> Result<Vec<Box<dyn Component>>, TrialError>;
}

/// Where operator input comes from.
#[derive(Clone)]
pub enum InputSource {
    /// A haptic device polled live.
    Device(Arc<dyn DeviceFactory>),
    /// A pre-recorded sensor log.
    Replay(PathBuf),
}

/// Frame broadcaster, input, marker publisher, recorder.
#[derive(Clone)]
pub struct StandardTopology {
    pub input: InputSource,
}

impl StandardTopology {
    pub fn new(input: InputSource) -> Self {
        Self { input }
    }
}

impl TopologyFactory for StandardTopology {
    fn build(&self, ctx: &TrialContext) -> Result<Vec<Box<dyn Component>>, TrialError> {
        let input: Box<dyn Component> = match &self.input {
            InputSource::Device(device) => Box::new(InputPublisher::new(
                Arc::clone(&ctx.params),
                Arc::clone(device),
                &ctx.settings,
            )),
            InputSource::Replay(path) => Box::new(SensorReplayer::new(path.clone())),
        };
        Ok(vec![
            Box::new(FrameBroadcaster::new(&ctx.settings)),
            input,
            Box::new(MarkerPublisher::new(Arc::clone(&ctx.params), &ctx.settings)),
            Box::new(RecorderComponent::new(
                ctx.run_id,
                Arc::clone(&ctx.params),
                Arc::clone(&ctx.store),
                &ctx.settings,
            )),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_broadcaster::FRAME_BROADCASTER_ID;
    use crate::input_publisher::INPUT_PUBLISHER_ID;
    use crate::marker_publisher::MARKER_PUBLISHER_ID;
    use crate::recorder::RECORDER_ID;
    use crate::replayer::REPLAYER_ID;
    use crate::storage::MemoryTrialStore;
    use teleop_hal::SimDeviceFactory;
    use teleop_kernel::{RawTrialArgs, resolve};

    fn context() -> TrialContext {
        TrialContext {
            run_id: Uuid::new_v4(),
            params: Arc::new(
                resolve(
                    &RawTrialArgs::new()
                        .set("participant_id", "1")
                        .set("autonomy_id", "0")
                        .set("trajectory_id", "0"),
                )
                .unwrap(),
            ),
            settings: TrialSettings::default(),
            store: Arc::new(MemoryTrialStore::new()),
        }
    }

    fn ids(components: &[Box<dyn Component>]) -> Vec<&str> {
        components.iter().map(|c| c.id()).collect()
    }

    #[test]
    fn device_topology_launch_order() {
        let device = Arc::new(SimDeviceFactory::default());
        let topology = StandardTopology::new(InputSource::Device(device));
        let components = topology.build(&context()).unwrap();
        assert_eq!(
            ids(&components),
            vec![FRAME_BROADCASTER_ID, INPUT_PUBLISHER_ID, MARKER_PUBLISHER_ID, RECORDER_ID]
        );
    }

    #[test]
    fn replay_replaces_the_input_publisher() {
        let topology = StandardTopology::new(InputSource::Replay(PathBuf::from("session.jsonl")));
        let components = topology.build(&context()).unwrap();
        assert_eq!(
            ids(&components),
            vec![FRAME_BROADCASTER_ID, REPLAYER_ID, MARKER_PUBLISHER_ID, RECORDER_ID]
        );
    }
}
