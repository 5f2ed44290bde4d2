//! [`Watchdog`] – component heartbeat monitor.
//!
//! Components refresh a heartbeat while they run; the orchestrator copies
//! those instants in with [`Watchdog::observe`] on every poll and asks
//! [`Watchdog::stale`] which components went silent.  Time is read from
//! [`tokio::time::Instant`], so a paused test runtime drives it.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// A heartbeat arrived within the deadline.
    Healthy,
    /// No heartbeat for longer than the deadline.
    TimedOut { silent_for: Duration },
    /// The component was never registered.
    Unknown,
}

struct ComponentEntry {
    last_heartbeat: Instant,
    timeout: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats from registered components and detects frozen ones.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use teleop_kernel::watchdog::{ComponentHealth, Watchdog};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut wd = Watchdog::new();
/// wd.register("recorder", Duration::from_secs(1));
/// assert_eq!(wd.health("recorder"), ComponentHealth::Healthy);
/// # }
/// ```
#[derive(Default)]
pub struct Watchdog {
    // Ordered so `stale` reports deterministically.
    components: BTreeMap<String, ComponentEntry>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `component_id` with a heartbeat deadline.  The deadline
    /// starts now; re-registering resets it.
    pub fn register(&mut self, component_id: &str, timeout: Duration) {
        self.components.insert(
            component_id.to_string(),
            ComponentEntry {
                last_heartbeat: Instant::now(),
                timeout,
            },
        );
    }

    /// Forget a component, e.g. once it stopped on purpose.
    pub fn unregister(&mut self, component_id: &str) {
        self.components.remove(component_id);
    }

    /// Record a heartbeat now.  No-op for unregistered components.
    pub fn heartbeat(&mut self, component_id: &str) {
        self.observe(component_id, Instant::now());
    }

    /// Record a heartbeat that happened at `at`.  Older instants than the
    /// one already known are ignored.
    pub fn observe(&mut self, component_id: &str, at: Instant) {
        if let Some(entry) = self.components.get_mut(component_id) {
            entry.last_heartbeat = entry.last_heartbeat.max(at);
        }
    }

    pub fn health(&self, component_id: &str) -> ComponentHealth {
        match self.components.get(component_id) {
            None => ComponentHealth::Unknown,
            Some(entry) => {
                let silent_for = entry.last_heartbeat.elapsed();
                if silent_for <= entry.timeout {
                    ComponentHealth::Healthy
                } else {
                    ComponentHealth::TimedOut { silent_for }
                }
            }
        }
    }

    /// Components past their deadline, with how long each has been silent.
    pub fn stale(&self) -> Vec<(String, Duration)> {
        self.components
            .iter()
            .filter_map(|(id, entry)| {
                let silent_for = entry.last_heartbeat.elapsed();
                (silent_for > entry.timeout).then(|| {
                    warn!(component = %id, ?silent_for, "heartbeat deadline exceeded");
                    (id.clone(), silent_for)
                })
            })
            .collect()
    }
}
