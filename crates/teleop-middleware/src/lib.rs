//! `teleop-middleware` – the trial's message plumbing.
//!
//! Routes time-stamped data between the trial components without caring
//! about its meaning beyond the schema of each topic.
//!
//! # Modules
//!
//! - [`bus`] – Typed, topic-based publish/subscribe bus with per-subscriber
//!   queue policies and publisher liveness.
//! - [`clock`] – Monotonic bus clock shared by every component.

pub mod bus;
pub mod clock;

pub use bus::{
    BusConfig, Envelope, Liveness, MessageBus, Publisher, QueuePolicy, Subscription,
    SubscriptionId, Topic, TopicStats, topics,
};
pub use clock::BusClock;
