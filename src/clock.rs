// ===============================
// src/clock.rs
// ===============================
use chrono::Utc;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::domain::TsMs;

/// Engine time source. Round windows, trade timestamps and snapshot
/// timestamps are all read from here.
pub trait Clock: Send + Sync + Debug {
    fn now_ms(&self) -> TsMs;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock anchored once, then advanced with tokio's monotonic instant.
/// Under a paused tokio runtime it follows the virtual time.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_ms: TsMs,
    base: Instant,
}

impl TokioClock {
    pub fn new() -> Self { Self::anchored(Utc::now().timestamp_millis()) }
    pub fn anchored(anchor_ms: TsMs) -> Self { Self { anchor_ms, base: Instant::now() } }
}

impl Default for TokioClock {
    fn default() -> Self { Self::new() }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> TsMs {
        self.anchor_ms + self.base.elapsed().as_millis() as i64
    }
}

/// Hand-driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: TsMs) -> Self { Self(AtomicI64::new(start_ms)) }
    pub fn set(&self, ts: TsMs) { self.0.store(ts, Ordering::SeqCst); }
    pub fn advance(&self, ms: i64) -> TsMs { self.0.fetch_add(ms, Ordering::SeqCst) + ms }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TsMs { self.0.load(Ordering::SeqCst) }
}
