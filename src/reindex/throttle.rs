//! Batch throttling driven by storage-backend feedback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// What the task is allowed to do for its next batch. The delay is mandatory;
/// the batch size is a ceiling the task may reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDirective {
    pub batch_size: usize,
    pub delay: Duration,
}

/// Oracle consulted before every reindex batch.
///
/// Rate-limited responses from the backend feed `observe_rate_limited`;
/// the oracle shrinks batches and inserts delays until pressure drains.
pub trait ThrottleOracle: Send + Sync {
    fn next_batch(&self) -> BatchDirective;
    fn observe_rate_limited(&self);
    fn observe_success(&self);
}

/// Multiplicative-decrease, additive-recovery throttle.
///
/// Each rate-limit halves the batch size and doubles the delay; each
/// successful batch steps the pressure back down by one.
pub struct AdaptiveThrottle {
    base_batch_size: usize,
    pressure: AtomicU32,
}

const MAX_PRESSURE: u32 = 8;
const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY: Duration = Duration::from_secs(5);

impl AdaptiveThrottle {
    pub fn new(base_batch_size: usize) -> Self {
        Self {
            base_batch_size: base_batch_size.max(1),
            pressure: AtomicU32::new(0),
        }
    }
}

impl ThrottleOracle for AdaptiveThrottle {
    fn next_batch(&self) -> BatchDirective {
        let pressure = self.pressure.load(Ordering::Relaxed);
        let batch_size = (self.base_batch_size >> pressure.min(6)).max(1);
        let delay = if pressure == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(BASE_DELAY_MS << (pressure - 1).min(6)).min(MAX_DELAY)
        };
        BatchDirective { batch_size, delay }
    }

    fn observe_rate_limited(&self) {
        let _ = self
            .pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_add(1).min(MAX_PRESSURE))
            });
    }

    fn observe_success(&self) {
        let _ = self
            .pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_sub(1))
            });
    }
}
