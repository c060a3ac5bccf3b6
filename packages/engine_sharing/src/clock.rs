//! Wall-clock source for presence timestamps.
//!
//! Timestamps written to the shared store are compared across contexts, so
//! they are milliseconds since the Unix epoch. [`TokioClock`] follows tokio's
//! (pausable) clock from a fixed epoch anchor, which keeps heartbeat tests
//! deterministic under `start_paused`.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Epoch-anchored clock driven by `tokio::time`.
#[derive(Clone, Debug)]
pub struct TokioClock {
    anchor: Instant,
    base_millis: i64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn starting_at(base_millis: i64) -> Self {
        Self {
            anchor: Instant::now(),
            base_millis,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_millis.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now_millis(), 1_250);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
