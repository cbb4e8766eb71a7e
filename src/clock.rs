use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    fn now_epoch_ms(&self) -> i64;

    fn now_epoch(&self) -> i64 {
        self.now_epoch_ms().div_euclid(1000)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used for TTL and abandonment tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn at_epoch(epoch_seconds: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(epoch_seconds.saturating_mul(1000)),
        }
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.now_ms
            .fetch_add(seconds.saturating_mul(1000), Ordering::SeqCst);
    }

    pub fn advance_ms(&self, millis: i64) {
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_in_seconds_and_millis() {
        let clock = ManualClock::at_epoch(1_700_000_000);
        assert_eq!(clock.now_epoch(), 1_700_000_000);

        clock.advance_ms(1_500);
        assert_eq!(clock.now_epoch_ms(), 1_700_000_001_500);
        assert_eq!(clock.now_epoch(), 1_700_000_001);

        clock.advance_seconds(2);
        assert_eq!(clock.now_epoch(), 1_700_000_003);
    }
}
