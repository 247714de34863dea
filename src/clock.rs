//! Wall-clock sources.
//!
//! ## Responsibility
//! Supply `DateTime<Utc>` timestamps for deadlines, audit records and
//! escalation arithmetic. Persisted timestamps are wall-clock so deadlines
//! survive restarts.
//!
//! ## Implementations
//! - [`SystemClock`]: real time, used in production.
//! - [`TokioClock`]: anchored to `tokio::time::Instant`, so it follows
//!   virtual time when the runtime is paused (`start_paused = true`).
//! - [`ManualClock`]: set explicitly; used for escalation arithmetic tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that advances with tokio's timer.
///
/// Captures `(Utc::now(), Instant::now())` at construction and reports
/// `origin + elapsed`. Under a paused runtime, `elapsed` is virtual.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_wall: DateTime<Utc>,
    origin_instant: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor a new clock at the current moment.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor a new clock so that "now" reads as `origin`.
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin_wall: origin,
            origin_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        saturating_after(self.origin_wall, self.origin_instant.elapsed())
    }
}

/// Manually driven clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// `from + d`, saturating at the largest representable timestamp.
pub(crate) fn saturating_after(from: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Non-negative elapsed time between `since` and `now`.
pub(crate) fn elapsed_between(since: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_advance_moves_forward() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));
    }

    #[test]
    fn test_elapsed_between_negative_is_zero() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(10);
        assert_eq!(elapsed_between(later, now), Duration::ZERO);
        assert_eq!(elapsed_between(now, later), Duration::from_secs(10));
    }

    #[test]
    fn test_saturating_after_never_overflows() {
        let now = Utc::now();
        assert_eq!(
            saturating_after(now, Duration::from_secs(90)),
            now + chrono::Duration::seconds(90)
        );
        let far = saturating_after(now, Duration::from_secs(10_000_000_000_000));
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
        assert_eq!(saturating_after(far, Duration::from_secs(1)), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_virtual_time() {
        let origin = Utc::now();
        let clock = TokioClock::starting_at(origin);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::seconds(600));
    }
}
