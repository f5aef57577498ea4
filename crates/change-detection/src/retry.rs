use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;

use crate::DetectorError;

/// The network retry policy shared by every detector: 1 s doubling to a 60 s
/// cap, ±20% jitter, no overall deadline (the surrounding task is cancelled
/// on stop).
pub(crate) fn network_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        randomization_factor: 0.2,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Same curve, bounded: used where the caller owes an answer within a pass.
pub(crate) fn bounded_backoff(budget: Duration) -> ExponentialBackoff {
    ExponentialBackoff { max_elapsed_time: Some(budget), ..network_backoff() }
}

/// Retry `op` while it fails transiently; permanent failures and retry-budget
/// exhaustion surface the last error.
pub(crate) async fn retry_transient<T, F, Fut>(
    policy: ExponentialBackoff,
    op: F,
) -> Result<T, DetectorError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DetectorError>>,
{
    backoff::future::retry(policy, move || {
        let attempt = op();
        async move {
            attempt.await.map_err(|err| {
                if err.is_transient() {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            ..network_backoff()
        };
        let value = retry_transient(policy, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(DetectorError::Transient("blip".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let err = retry_transient::<(), _, _>(network_backoff(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(DetectorError::Auth("denied".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DetectorError::Auth(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
