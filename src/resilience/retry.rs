//! Bounded retry for infrastructure calls
//!
//! A [`RetryPolicy`] says how many times a call may be attempted and how
//! long to wait in between. [`retry_if`] drives the attempts and stops early
//! on errors the caller classifies as permanent; [`retry_with_timeout`]
//! additionally bounds every single attempt.
//!
//! ```rust,ignore
//! use tokio_deploy_orchestrator::resilience::retry::{retry_with_timeout, RetryPolicy};
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_secs(2));
//! retry_with_timeout(
//!     &policy,
//!     Duration::from_secs(10),
//!     || infra.shift_traffic(&id, 50),
//!     InfraError::is_retryable,
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// How many attempts a call gets and the pause between them.
///
/// Pauses double after every failure, starting at `first` and never
/// exceeding `cap`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    /// Pause after the first failure.
    pub first: Duration,
    /// Longest single pause.
    pub cap: Duration,
    /// Stretch each pause by a random amount of up to a quarter.
    pub jitter: bool,
}

/// A single attempt ran past its per-call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeout(pub Duration);

impl RetryPolicy {
    /// Doubling pauses starting at `first`, capped at one minute.
    pub fn exponential(max_attempts: usize, first: Duration) -> Self {
        Self::exponential_capped(max_attempts, first, Duration::from_secs(60))
    }

    /// Doubling pauses starting at `first`, never longer than `cap`.
    pub fn exponential_capped(max_attempts: usize, first: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            first,
            cap,
            jitter: false,
        }
    }

    /// Same policy with jittered pauses when `enabled`.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Pause after failed attempt number `failed` (1-based).
    pub fn pause_after(&self, failed: usize) -> Duration {
        let doublings = failed.saturating_sub(1).min(31) as u32;
        let pause = self.first.saturating_mul(1u32 << doublings).min(self.cap);
        if self.jitter {
            jittered(pause)
        } else {
            pause
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 2s then 4s apart.
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(2))
    }
}

/// Run `op` until it succeeds, `should_retry` rejects its error, or the
/// policy runs out of attempts. The last error is returned.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut op: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let limit = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "call recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            warn!(attempt, error = %err, "permanent failure, not retrying");
            return Err(err);
        }
        if attempt >= limit {
            warn!(attempts = attempt, error = %err, "retry budget exhausted");
            return Err(err);
        }

        let pause = policy.pause_after(attempt);
        debug!(
            attempt,
            limit,
            pause_ms = pause.as_millis() as u64,
            error = %err,
            "transient failure, backing off"
        );
        tokio::time::sleep(pause).await;
        attempt += 1;
    }
}

/// [`retry_if`] with each attempt cut off after `per_call`.
///
/// A cut-off attempt becomes `E::from(CallTimeout(per_call))` and is then
/// classified by `should_retry` like any other error.
pub async fn retry_with_timeout<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    per_call: Duration,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display + From<CallTimeout>,
{
    retry_if(
        policy,
        || {
            let call = op();
            async move {
                tokio::time::timeout(per_call, call)
                    .await
                    .unwrap_or_else(|_| Err(E::from(CallTimeout(per_call))))
            }
        },
        should_retry,
    )
    .await
}

fn jittered(pause: Duration) -> Duration {
    let spread = pause.as_millis() / 4;
    if spread == 0 {
        return pause;
    }
    let extra = rand::thread_rng().gen_range(0..spread) as u64;
    pause + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum CallError {
        Transient,
        Permanent,
        Hung,
    }

    impl std::fmt::Display for CallError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl From<CallTimeout> for CallError {
        fn from(_: CallTimeout) -> Self {
            CallError::Hung
        }
    }

    type Attempt = std::pin::Pin<Box<dyn Future<Output = Result<u8, CallError>> + Send>>;

    /// Operation failing transiently `failures` times before succeeding.
    fn flaky(calls: &Arc<AtomicUsize>, failures: usize) -> impl FnMut() -> Attempt {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let attempt: Attempt = Box::pin(async move {
                if n < failures {
                    Err(CallError::Transient)
                } else {
                    Ok(42)
                }
            });
            attempt
        }
    }

    /// Constant pause of `pause` between attempts.
    fn steady(max_attempts: usize, pause: Duration) -> RetryPolicy {
        RetryPolicy::exponential_capped(max_attempts, pause, pause)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = steady(5, Duration::from_millis(10));

        let out = retry_if(&policy, flaky(&calls, 2), |_| true).await;

        assert_eq!(out, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_last_error_after_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::exponential(3, Duration::from_secs(2));
        let start = tokio::time::Instant::now();

        let out = retry_if(&policy, flaky(&calls, usize::MAX), |_| true).await;

        assert_eq!(out, Err(CallError::Transient));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = steady(5, Duration::from_millis(10));
        let counter = Arc::clone(&calls);

        let out: Result<(), CallError> = retry_if(
            &policy,
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(CallError::Transient)
                    } else {
                        Err(CallError::Permanent)
                    }
                }
            },
            |e| *e == CallError::Transient,
        )
        .await;

        assert_eq!(out, Err(CallError::Permanent));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempt_policy_still_calls_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = steady(0, Duration::from_secs(1));

        let out = retry_if(&policy, flaky(&calls, usize::MAX), |_| true).await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_is_cut_off_and_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = steady(2, Duration::from_secs(1));
        let counter = Arc::clone(&calls);

        let out: Result<(), CallError> = retry_with_timeout(
            &policy,
            Duration::from_secs(5),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(out, Err(CallError::Hung));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exponential_pauses_double_then_cap() {
        let policy =
            RetryPolicy::exponential_capped(10, Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(policy.pause_after(1), Duration::from_secs(2));
        assert_eq!(policy.pause_after(2), Duration::from_secs(4));
        assert_eq!(policy.pause_after(3), Duration::from_secs(5));
        assert_eq!(policy.pause_after(60), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = steady(3, Duration::from_secs(1)).with_jitter(true);
        for _ in 0..50 {
            let pause = policy.pause_after(1);
            assert!(pause >= Duration::from_secs(1));
            assert!(pause < Duration::from_millis(1250));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
