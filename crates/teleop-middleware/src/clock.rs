//! Monotonic bus clock.
//!
//! Every timestamp on the bus is a [`Duration`] since the clock's origin.
//! The clock is built on [`tokio::time::Instant`] so tests running with a
//! paused runtime observe virtual time.  Wall-clock time never appears here.

use std::time::Duration;

use tokio::time::Instant;

/// Shared monotonic time base.  `Copy`, so every component holds its own.
#[derive(Debug, Clone, Copy)]
pub struct BusClock {
    origin: Instant,
}

impl BusClock {
    /// Start a clock whose origin is "now".
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the origin.
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    /// The [`Instant`] corresponding to bus time `t`, for `sleep_until`.
    pub fn instant_at(&self, t: Duration) -> Instant {
        self.origin + t
    }
}

impl Default for BusClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_runtime_time() {
        let clock = BusClock::new();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now(), Duration::from_millis(250));
        assert_eq!(
            clock.instant_at(Duration::from_secs(1)) - clock.instant_at(Duration::ZERO),
            Duration::from_secs(1)
        );
    }
}
