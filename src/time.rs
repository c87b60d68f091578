//! `PreciseDate`: a nanosecond-resolution wall-clock timestamp used for
//! `Message::publish_time`.
//!
//! `std::time::SystemTime` already carries nanosecond resolution on every
//! platform this crate targets, but two messages published back to back can
//! legitimately land on the same tick. `PreciseDate` breaks that tie with a
//! monotonically increasing sequence number so publish order is always
//! recoverable from the timestamp alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A point in wall-clock time with nanosecond resolution plus a tie-breaking
/// sequence number for same-tick ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct PreciseDate {
    nanos_since_epoch: u128,
    sequence: u64,
}

impl PreciseDate {
    /// Captures the current wall-clock time.
    pub fn now() -> Self {
        let nanos_since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        Self {
            nanos_since_epoch,
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn nanos_since_epoch(&self) -> u128 {
        self.nanos_since_epoch
    }

    pub fn as_duration_since_epoch(&self) -> Duration {
        Duration::from_nanos(self.nanos_since_epoch.min(u64::MAX as u128) as u64)
    }

    /// `true` if `self + age` is older than `now`, i.e. retention/expiry has elapsed.
    pub fn elapsed_by(&self, age: Duration, now: PreciseDate) -> bool {
        now.as_duration_since_epoch()
            .checked_sub(self.as_duration_since_epoch())
            .map(|elapsed| elapsed >= age)
            .unwrap_or(false)
    }

    /// `self` offset forward by `delta`, used to compute a lease deadline.
    pub fn plus(&self, delta: Duration) -> Self {
        Self {
            nanos_since_epoch: self.nanos_since_epoch + delta.as_nanos(),
            sequence: self.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_calls_are_strictly_ordered() {
        let a = PreciseDate::now();
        let b = PreciseDate::now();
        assert!(a < b);
    }

    #[test]
    fn elapsed_by_detects_expiry() {
        let past = PreciseDate::now();
        std::thread::sleep(Duration::from_millis(5));
        let now = PreciseDate::now();
        assert!(past.elapsed_by(Duration::from_millis(1), now));
        assert!(!past.elapsed_by(Duration::from_secs(60), now));
    }
}
