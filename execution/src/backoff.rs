//! Retry policy for calls to external services.

use crate::error::{EngineError, ServiceError};
use rand::{Rng, RngCore};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff after the given backoff, doubled and capped.
    pub fn next_backoff(&self, backoff: Duration) -> Duration {
        backoff.saturating_mul(2).min(self.max_backoff)
    }
}

pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // "Equal jitter": delay is in [backoff/2, backoff].
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Sleep for a jittered version of `backoff`.
pub(crate) async fn sleep_with_jitter(backoff: Duration) {
    let delay = jittered_backoff(&mut rand::thread_rng(), backoff);
    tokio::time::sleep(delay).await;
}

/// Bound a single service call by `timeout`.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(timeout)),
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
pub async fn retry_call<T, F, Fut>(
    policy: &RetryPolicy,
    call_timeout: Duration,
    operation: &'static str,
    mut call: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match with_timeout(call_timeout, call()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempts < policy.attempts() => {
                warn!(operation, attempts, error = %err, "transient failure, retrying");
                sleep_with_jitter(backoff).await;
                backoff = policy.next_backoff(backoff);
            }
            Err(source) => {
                return Err(EngineError::External {
                    operation,
                    attempts,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_jittered_backoff_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = jittered_backoff(&mut rng, Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
        assert_eq!(
            jittered_backoff(&mut rng, Duration::from_millis(1)),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_next_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(
            policy.next_backoff(Duration::from_millis(200)),
            Duration::from_millis(400)
        );
        assert_eq!(
            policy.next_backoff(Duration::from_millis(400)),
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn test_retry_call_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_call(&fast_policy(3), Duration::from_secs(1), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServiceError::Unavailable("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_call_exhausts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_call(&fast_policy(2), Duration::from_secs(1), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ServiceError::RateLimited)
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::External {
                attempts: 2,
                source: ServiceError::RateLimited,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_call_stops_on_rejection() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_call(&fast_policy(5), Duration::from_secs(1), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ServiceError::Rejected("no".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::External { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient() {
        let err = with_timeout(Duration::from_millis(5), async {
            std::future::pending::<Result<(), ServiceError>>().await
        })
        .await
        .unwrap_err();
        assert_eq!(err, ServiceError::Timeout(Duration::from_millis(5)));
        assert!(err.is_transient());
    }
}
