//! Static frame broadcaster.
//!
//! Publishes the fixed calibration transforms on `tf_static` once at
//! startup, reports ready, and re-publishes them every `frame_heartbeat` so
//! late subscribers pick them up.

use std::time::Duration;

use async_trait::async_trait;
use teleop_middleware::topics;
use teleop_types::{FrameTransform, Message, TrialError};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::component::{Component, ComponentContext, ControlSignal};
use crate::settings::TrialSettings;

pub const FRAME_BROADCASTER_ID: &str = "frame_broadcaster";

pub struct FrameBroadcaster {
    transforms: Vec<FrameTransform>,
    heartbeat: Duration,
}

impl FrameBroadcaster {
    pub fn new(settings: &TrialSettings) -> Self {
        Self {
            transforms: settings.frame_transforms.clone(),
            heartbeat: settings.frame_heartbeat,
        }
    }
}

#[async_trait]
impl Component for FrameBroadcaster {
    fn id(&self) -> &str {
        FRAME_BROADCASTER_ID
    }

    async fn run(self: Box<Self>, ctx: &mut ComponentContext) -> Result<(), TrialError> {
        let publisher = ctx.bus().advertise(&topics::TF_STATIC, FRAME_BROADCASTER_ID)?;
        publisher
            .publish(Message::Transform(self.transforms.clone()))
            .await?;
        info!(frames = self.transforms.len(), "static frames published");
        ctx.set_ready();

        let mut ticker = interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup publish covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                signal = ctx.recv_control() => {
                    if signal == ControlSignal::Shutdown {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    let delivered = publisher
                        .publish(Message::Transform(self.transforms.clone()))
                        .await?;
                    debug!(delivered, "static frames re-published");
                    ctx.heartbeat();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentHandle, Readiness};
    use teleop_middleware::{Liveness, MessageBus, QueuePolicy};
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn publishes_at_startup_and_on_heartbeat() {
        let bus = MessageBus::default();
        let mut frames = bus.subscribe(&topics::TF_STATIC, QueuePolicy::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ComponentHandle::spawn(
            Box::new(FrameBroadcaster::new(&TrialSettings::default())),
            bus.clone(),
            tx,
        );

        let first = frames.recv().await.unwrap();
        let Message::Transform(transforms) = first.message else {
            panic!("tf_static carries transforms");
        };
        assert_eq!(transforms.len(), 2);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.readiness(), Readiness::Ready);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let mut republished = 0;
        while frames.try_recv().is_some() {
            republished += 1;
        }
        assert_eq!(republished, 2);
        assert_eq!(bus.liveness("tf_static"), Liveness::Alive);

        handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(bus.liveness("tf_static"), Liveness::Withdrawn);
    }
}
