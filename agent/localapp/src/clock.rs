//! Wall-clock time for lease deadlines.
//!
//! Deadlines are stored in the shared store and compared by other processes,
//! so they are wall-clock milliseconds since the Unix epoch.

use std::fmt::Debug;

use chrono::Utc;
use tokio::time::Instant;

pub trait Clock: Debug + Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Wall time anchored at construction and advanced by tokio's monotonic
/// clock. Under a paused tokio runtime deadlines move with virtual time.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_ms: i64,
    anchor: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            anchor_ms: Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_ms.saturating_add(elapsed)
    }
}
