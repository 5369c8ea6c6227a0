//! Millisecond clocks for timestamps and durations.
//!
//! Everything in the engine that stamps or measures time goes through
//! [`Clock`], so conversations can run under tokio's paused test clock.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Wall clock anchored once, advanced by `tokio::time::Instant`.
///
/// Under `#[tokio::test(start_paused = true)]` this advances only with
/// virtual time.
#[derive(Debug, Clone)]
pub struct TokioClock {
    epoch_millis: u64,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            epoch_millis: Utc::now().timestamp_millis().max(0) as u64,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.epoch_millis + self.anchor.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for unit tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
