//! Expiry sweeper for terminal jobs.
//!
//! The coordinator polls [`ExpirySweeper::tick`] in its event loop and runs a
//! sweep on every tick; the registry also sweeps on admission and lookups so
//! stale entries never outlive their retention window observably.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::debug;

use super::registry::JobRegistry;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids of the evicted jobs.
    pub evicted: Vec<String>,
    /// Payload bytes released with them.
    pub freed_bytes: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }
}

/// Fixed-interval ticker driving periodic sweeps.
pub struct ExpirySweeper {
    ticker: Interval,
    period: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper whose first tick fires one `period` from now.
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        // A coordinator busy with a burst of messages should not sweep
        // several times in a row to catch up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { ticker, period }
    }

    /// Wait for the next tick.
    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Evict every job whose `expires_at` is at or before `now`.
    pub fn sweep(registry: &mut JobRegistry, now: DateTime<Utc>, trigger: &'static str) -> SweepReport {
        let report = registry.sweep_expired(now);
        if !report.is_empty() {
            debug!(
                trigger,
                evicted = report.evicted.len(),
                freed_bytes = report.freed_bytes,
                "Swept expired jobs"
            );
        }
        report
    }
}
