//! Typed, topic-based publish/subscribe message bus.
//!
//! Every [`Topic`] has a fixed [`Schema`]; a publisher, subscriber or
//! message that disagrees with it is rejected with
//! [`BusError::SchemaMismatch`] instead of being dropped silently.
//!
//! # Delivery
//!
//! Each subscriber owns its own queue, chosen by [`QueuePolicy`]:
//!
//! | Policy | Overflow behaviour | Used by |
//! |---|---|---|
//! | [`QueuePolicy::DropOldest`] | oldest message discarded and counted | real-time pose consumers (freshness first) |
//! | [`QueuePolicy::Reliable`] | publisher waits up to `send_timeout`, then the message is counted as dropped | the trajectory recorder (completeness first) |
//!
//! Delivery is at-most-once per subscriber.  Messages from one publisher
//! reach a given subscriber in publish order; there is no ordering across
//! topics.  Publishing to a topic nobody listens to is not an error.
//!
//! # Liveness
//!
//! Publishers are registered with [`MessageBus::advertise`].  A topic whose
//! publisher has gone quiet reports [`Liveness::Silent`], one whose
//! publisher handle was dropped reports [`Liveness::Withdrawn`], and a topic
//! no publisher ever touched reports [`Liveness::Unknown`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use teleop_types::{BusError, Message, Schema};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::BusClock;

/// Default depth of a [`QueuePolicy::DropOldest`] queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// A publisher that has not published or heartbeated for this long is
/// reported as [`Liveness::Silent`].
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on how long a [`QueuePolicy::Reliable`] delivery may wait.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(50);

// ────────────────────────────────────────────────────────────────────────────
// Topics
// ────────────────────────────────────────────────────────────────────────────

/// A named channel with a fixed message schema.  Identity is the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic {
    pub name: &'static str,
    pub schema: Schema,
}

impl Topic {
    pub const fn new(name: &'static str, schema: Schema) -> Self {
        Self { name, schema }
    }
}

/// The standard topics of a trial topology.
pub mod topics {
    use super::Topic;
    use teleop_types::Schema;

    /// Raw haptic-device pose (`PoseSource::Device`).
    pub const DEVICE_POSE: Topic = Topic::new("falcon_position", Schema::Pose);
    /// Mapped robot target consumed by the external controller
    /// (`PoseSource::Robot`).
    pub const ROBOT_TARGET: Topic = Topic::new("robot_target_pose", Schema::Pose);
    /// Visualization markers for the passive 3-D viewer.
    pub const MARKERS: Topic = Topic::new("visualization_marker_array", Schema::MarkerSet);
    /// Static coordinate-frame transforms.
    pub const TF_STATIC: Topic = Topic::new("tf_static", Schema::Transform);
    /// Recording-window triggers.
    pub const RECORD: Topic = Topic::new("record", Schema::Trigger);

    pub const ALL: [Topic; 5] = [DEVICE_POSE, ROBOT_TARGET, MARKERS, TF_STATIC, RECORD];

    /// Look up a standard topic by name.
    pub fn by_name(name: &str) -> Option<Topic> {
        ALL.iter().copied().find(|t| t.name == name)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Per-subscriber queueing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Bounded queue; on overflow the oldest message is discarded.
    DropOldest { depth: usize },
    /// Bounded queue sized for the whole trial; a full queue makes the
    /// delivery wait at most `send_timeout` before the message is dropped.
    Reliable {
        capacity: usize,
        send_timeout: Duration,
    },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::DropOldest {
            depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// A message as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: &'static str,
    /// Per-topic sequence number assigned at publish time.
    pub seq: u64,
    pub publisher: Arc<str>,
    /// Bus time at which the message was published.
    pub published_at: Duration,
    pub message: Message,
}

/// Identifier of a subscription, used with
/// [`MessageBus::unsubscribe_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Liveness of a topic's publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No publisher has ever been registered for the topic.
    Unknown,
    /// At least one publisher heartbeated within the liveness timeout.
    Alive,
    /// Publishers exist but none has been heard from for `silent_for`.
    Silent { silent_for: Duration },
    /// Every publisher has withdrawn its handle.
    Withdrawn,
}

/// Snapshot of a topic's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub published: u64,
    pub delivered: u64,
    /// Messages discarded by drop-oldest queues.
    pub dropped_overflow: u64,
    /// Messages a reliable queue could not accept in time.
    pub dropped_timeout: u64,
    pub subscribers: usize,
    pub publishers: usize,
}

/// Bus-wide settings.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub liveness_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_timeout: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct PublisherState {
    last_seen: Instant,
    withdrawn: bool,
}

#[derive(Debug)]
struct TopicEntry {
    schema: Schema,
    next_seq: u64,
    subscribers: Vec<(SubscriptionId, Sink)>,
    publishers: HashMap<Arc<str>, PublisherState>,
    counters: Arc<Counters>,
}

impl TopicEntry {
    fn new(schema: Schema) -> Self {
        Self {
            schema,
            next_seq: 0,
            subscribers: Vec::new(),
            publishers: HashMap::new(),
            counters: Arc::default(),
        }
    }
}

/// Fetch (or lazily create) the entry for `topic`, enforcing its schema.
fn entry<'a>(
    topics: &'a mut HashMap<&'static str, TopicEntry>,
    topic: &Topic,
) -> Result<&'a mut TopicEntry, BusError> {
    let entry = topics
        .entry(topic.name)
        .or_insert_with(|| TopicEntry::new(topic.schema));
    if entry.schema != topic.schema {
        return Err(BusError::SchemaMismatch {
            topic: topic.name.to_string(),
            declared: entry.schema,
            found: topic.schema,
        });
    }
    Ok(entry)
}

/// Bounded drop-oldest queue shared between the bus and one subscriber.
#[derive(Debug)]
struct RingQueue {
    depth: usize,
    items: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl RingQueue {
    fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            items: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue; returns `true` when the oldest entry had to be discarded.
    fn push(&self, envelope: Envelope) -> bool {
        let overflowed = {
            let mut items = lock(&self.items);
            let overflowed = if items.len() >= self.depth {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(envelope);
            overflowed
        };
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        overflowed
    }

    fn try_pop(&self) -> Option<Envelope> {
        lock(&self.items).pop_front()
    }

    async fn pop(&self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.try_pop() {
                return Some(envelope);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone)]
enum Sink {
    DropOldest(Arc<RingQueue>),
    Reliable {
        tx: mpsc::Sender<Envelope>,
        send_timeout: Duration,
        dropped: Arc<AtomicU64>,
    },
}

enum DeliveryOutcome {
    Delivered,
    Overflowed,
    TimedOut,
    Closed,
}

impl Sink {
    async fn deliver(&self, envelope: Envelope) -> DeliveryOutcome {
        match self {
            Sink::DropOldest(queue) => {
                if queue.closed.load(Ordering::Acquire) {
                    DeliveryOutcome::Closed
                } else if queue.push(envelope) {
                    DeliveryOutcome::Overflowed
                } else {
                    DeliveryOutcome::Delivered
                }
            }
            Sink::Reliable {
                tx,
                send_timeout,
                dropped,
            } => match tx.send_timeout(envelope, *send_timeout).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(SendTimeoutError::Timeout(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    DeliveryOutcome::TimedOut
                }
                Err(SendTimeoutError::Closed(_)) => DeliveryOutcome::Closed,
            },
        }
    }
}

#[derive(Debug)]
struct Inner {
    clock: BusClock,
    config: BusConfig,
    next_subscription: AtomicU64,
    topics: Mutex<HashMap<&'static str, TopicEntry>>,
}

// ────────────────────────────────────────────────────────────────────────────
// MessageBus
// ────────────────────────────────────────────────────────────────────────────

/// Shared message bus.  Clone it cheaply – all clones share the same topic
/// registry and clock.
#[derive(Debug, Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock: BusClock::new(),
                config,
                next_subscription: AtomicU64::new(0),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The bus's monotonic clock.
    pub fn clock(&self) -> BusClock {
        self.inner.clock
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Register `publisher` on `topic` and return a handle that publishes as
    /// it.  Fails when `topic` disagrees with the topic's registered schema.
    pub fn advertise(&self, topic: &Topic, publisher: &str) -> Result<Publisher, BusError> {
        let id: Arc<str> = Arc::from(publisher);
        {
            let mut topics = lock(&self.inner.topics);
            let entry = entry(&mut topics, topic)?;
            entry.publishers.insert(
                Arc::clone(&id),
                PublisherState {
                    last_seen: Instant::now(),
                    withdrawn: false,
                },
            );
        }
        debug!(topic = topic.name, publisher, "publisher advertised");
        Ok(Publisher {
            bus: self.clone(),
            topic: *topic,
            id,
        })
    }

    /// Publish `message` on `topic` on behalf of `publisher`.
    ///
    /// Returns the number of subscribers the message was handed to.
    /// `Ok(0)` means nobody is listening, which is a normal condition.
    pub async fn publish(
        &self,
        topic: &Topic,
        publisher: &str,
        message: Message,
    ) -> Result<usize, BusError> {
        if message.schema() != topic.schema {
            return Err(BusError::SchemaMismatch {
                topic: topic.name.to_string(),
                declared: topic.schema,
                found: message.schema(),
            });
        }

        let (envelope, sinks, counters) = {
            let mut topics = lock(&self.inner.topics);
            let entry = entry(&mut topics, topic)?;
            let publisher_id = match entry.publishers.get_key_value(publisher) {
                Some((key, _)) => Arc::clone(key),
                None => Arc::from(publisher),
            };
            entry.publishers.insert(
                Arc::clone(&publisher_id),
                PublisherState {
                    last_seen: Instant::now(),
                    withdrawn: false,
                },
            );
            let seq = entry.next_seq;
            entry.next_seq += 1;
            let envelope = Envelope {
                topic: topic.name,
                seq,
                publisher: publisher_id,
                published_at: self.inner.clock.now(),
                message,
            };
            (envelope, entry.subscribers.clone(), Arc::clone(&entry.counters))
        };
        counters.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in sinks {
            match sink.deliver(envelope.clone()).await {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::Overflowed => {
                    delivered += 1;
                    counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::TimedOut => {
                    counters.dropped_timeout.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = topic.name,
                        seq = envelope.seq,
                        subscription = id.0,
                        "reliable subscriber did not accept message in time; dropped"
                    );
                }
                DeliveryOutcome::Closed => closed.push(id),
            }
        }
        counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        for id in closed {
            self.detach(topic.name, id);
        }
        Ok(delivered)
    }

    // -----------------------------------------------------------------------
    // Subscribing
    // -----------------------------------------------------------------------

    /// Subscribe to `topic` with its own queue governed by `policy`.
    pub fn subscribe(&self, topic: &Topic, policy: QueuePolicy) -> Result<Subscription, BusError> {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (sink, inbox) = match policy {
            QueuePolicy::DropOldest { depth } => {
                let queue = Arc::new(RingQueue::new(depth));
                (Sink::DropOldest(Arc::clone(&queue)), Inbox::DropOldest(queue))
            }
            QueuePolicy::Reliable {
                capacity,
                send_timeout,
            } => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let dropped = Arc::new(AtomicU64::new(0));
                (
                    Sink::Reliable {
                        tx,
                        send_timeout,
                        dropped: Arc::clone(&dropped),
                    },
                    Inbox::Reliable { rx, dropped },
                )
            }
        };

        {
            let mut topics = lock(&self.inner.topics);
            entry(&mut topics, topic)?.subscribers.push((id, sink));
        }
        debug!(topic = topic.name, subscription = id.0, ?policy, "subscribed");
        Ok(Subscription {
            id,
            topic: *topic,
            inbox,
            bus: self.clone(),
        })
    }

    /// Subscribe and run `handler` for every delivered message on a
    /// background task.  Must be called from within a Tokio runtime.
    pub fn subscribe_with<F>(
        &self,
        topic: &Topic,
        policy: QueuePolicy,
        mut handler: F,
    ) -> Result<SubscriptionId, BusError>
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let mut subscription = self.subscribe(topic, policy)?;
        let id = subscription.id();
        tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                handler(envelope);
            }
        });
        Ok(id)
    }

    /// Remove a subscription.  Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Remove a handler subscription created by [`subscribe_with`].
    ///
    /// Returns `false` when no such subscription exists.
    ///
    /// [`subscribe_with`]: MessageBus::subscribe_with
    pub fn unsubscribe_handler(&self, id: SubscriptionId) -> bool {
        let names: Vec<&'static str> = lock(&self.inner.topics).keys().copied().collect();
        names.into_iter().any(|name| self.detach(name, id))
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Liveness of the publishers of `topic_name`.
    pub fn liveness(&self, topic_name: &str) -> Liveness {
        let topics = lock(&self.inner.topics);
        let Some(entry) = topics.get(topic_name) else {
            return Liveness::Unknown;
        };
        if entry.publishers.is_empty() {
            return Liveness::Unknown;
        }
        let freshest = entry
            .publishers
            .values()
            .filter(|p| !p.withdrawn)
            .map(|p| p.last_seen.elapsed())
            .min();
        match freshest {
            None => Liveness::Withdrawn,
            Some(age) if age <= self.inner.config.liveness_timeout => Liveness::Alive,
            Some(age) => Liveness::Silent { silent_for: age },
        }
    }

    /// Counter snapshot for `topic_name`, or `None` for an unknown topic.
    pub fn metrics(&self, topic_name: &str) -> Option<TopicStats> {
        let topics = lock(&self.inner.topics);
        topics.get(topic_name).map(|entry| TopicStats {
            published: entry.counters.published.load(Ordering::Relaxed),
            delivered: entry.counters.delivered.load(Ordering::Relaxed),
            dropped_overflow: entry.counters.dropped_overflow.load(Ordering::Relaxed),
            dropped_timeout: entry.counters.dropped_timeout.load(Ordering::Relaxed),
            subscribers: entry.subscribers.len(),
            publishers: entry.publishers.values().filter(|p| !p.withdrawn).count(),
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn touch(&self, topic: &Topic, publisher: &Arc<str>) {
        let mut topics = lock(&self.inner.topics);
        if let Some(state) = topics
            .get_mut(topic.name)
            .and_then(|entry| entry.publishers.get_mut(publisher))
        {
            state.last_seen = Instant::now();
        }
    }

    fn withdraw(&self, topic: &Topic, publisher: &Arc<str>) {
        let mut topics = lock(&self.inner.topics);
        if let Some(state) = topics
            .get_mut(topic.name)
            .and_then(|entry| entry.publishers.get_mut(publisher))
        {
            state.withdrawn = true;
        }
        debug!(topic = topic.name, publisher = %publisher, "publisher withdrawn");
    }

    fn detach(&self, topic_name: &str, id: SubscriptionId) -> bool {
        let mut topics = lock(&self.inner.topics);
        let Some(entry) = topics.get_mut(topic_name) else {
            return false;
        };
        let Some(pos) = entry.subscribers.iter().position(|(sid, _)| *sid == id) else {
            return false;
        };
        let (_, sink) = entry.subscribers.remove(pos);
        if let Sink::DropOldest(queue) = sink {
            queue.close();
        }
        true
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Publisher handle
// ────────────────────────────────────────────────────────────────────────────

/// A registered publisher.  Dropping it withdraws the publisher, which the
/// topic's [`Liveness`] then reports.
#[derive(Debug)]
pub struct Publisher {
    bus: MessageBus,
    topic: Topic,
    id: Arc<str>,
}

impl Publisher {
    pub async fn publish(&self, message: Message) -> Result<usize, BusError> {
        self.bus.publish(&self.topic, &self.id, message).await
    }

    /// Refresh liveness without publishing.
    pub fn heartbeat(&self) {
        self.bus.touch(&self.topic, &self.id);
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.bus.withdraw(&self.topic, &self.id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Subscription
// ────────────────────────────────────────────────────────────────────────────

enum Inbox {
    DropOldest(Arc<RingQueue>),
    Reliable {
        rx: mpsc::Receiver<Envelope>,
        dropped: Arc<AtomicU64>,
    },
}

/// The receiving end of one subscriber's queue.  Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    inbox: Inbox,
    bus: MessageBus,
}

impl Subscription {
    /// Wait for the next message.  Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        match &mut self.inbox {
            Inbox::DropOldest(queue) => queue.pop().await,
            Inbox::Reliable { rx, .. } => rx.recv().await,
        }
    }

    /// Take the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        match &mut self.inbox {
            Inbox::DropOldest(queue) => queue.try_pop(),
            Inbox::Reliable { rx, .. } => rx.try_recv().ok(),
        }
    }

    /// Messages this subscriber lost to overflow or delivery timeouts.
    pub fn dropped(&self) -> u64 {
        match &self.inbox {
            Inbox::DropOldest(queue) => queue.dropped.load(Ordering::Relaxed),
            Inbox::Reliable { dropped, .. } => dropped.load(Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.detach(self.topic.name, self.id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
