use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// No event seen yet.
pub const NO_WATERMARK: i64 = i64::MIN;

/// Processor-wide event-time watermark in epoch milliseconds.
///
/// Cloning shares the same value. Updates only move it forward.
#[derive(Debug, Clone)]
pub struct SharedWatermark(Arc<AtomicI64>);

impl SharedWatermark {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(NO_WATERMARK)))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to `candidate` if it is higher; returns the resulting value.
    pub fn advance(&self, candidate: i64) -> i64 {
        let prev = self.0.fetch_max(candidate, Ordering::AcqRel);
        prev.max(candidate)
    }
}

impl Default for SharedWatermark {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives the watermark from observed event times:
/// `max(current, max_event_time - delay)`.
#[derive(Debug, Clone)]
pub struct WatermarkEstimator {
    delay_ms: i64,
    max_event_ms: i64,
    shared: SharedWatermark,
}

impl WatermarkEstimator {
    pub fn new(delay_ms: i64, shared: SharedWatermark) -> Self {
        Self {
            delay_ms,
            max_event_ms: NO_WATERMARK,
            shared,
        }
    }

    /// Record an event time and advance the shared watermark.
    pub fn observe(&mut self, event_time_ms: i64) -> i64 {
        self.max_event_ms = self.max_event_ms.max(event_time_ms);
        self.shared
            .advance(self.max_event_ms.saturating_sub(self.delay_ms))
    }

    /// Accept a watermark announced by the source itself.
    pub fn observe_explicit(&mut self, watermark_ms: i64) -> i64 {
        self.shared.advance(watermark_ms)
    }

    pub fn current(&self) -> i64 {
        self.shared.get()
    }

    pub fn shared(&self) -> &SharedWatermark {
        &self.shared
    }
}
