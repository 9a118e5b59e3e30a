//! Bounded retry for writes racing ahead of their foreign-key parents.
//!
//! Webhook delivery order is not guaranteed, so a subscription row can arrive
//! before the customer row it references. Foreign-key violations are treated
//! as transient and retried on a fixed interval; every other store error is
//! surfaced immediately.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::FixedInterval;

use crate::error::{BillingError, BillingResult};
use crate::store::StoreError;

/// Total attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(2000);

/// Run `op` until it succeeds, fails with a non-retryable error, or exhausts
/// `max_attempts`. Only foreign-key violations are retried.
pub async fn with_conflict_retry<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut op: F,
) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delays = FixedInterval::new(delay).take(max_attempts.saturating_sub(1) as usize);
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_foreign_key_violation() => match delays.next() {
                Some(pause) => {
                    tracing::warn!(
                        attempt = attempt,
                        delay_ms = pause.as_millis() as u64,
                        error = %err,
                        "store write hit a foreign-key conflict, retrying"
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                None => {
                    return Err(BillingError::RetryExhausted {
                        attempts: attempt,
                        source: err,
                    })
                }
            },
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fk_error() -> StoreError {
        StoreError::ForeignKeyViolation("subscriptions_user_id_fkey".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_skips_delays() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let started = tokio::time::Instant::now();
        let result = with_conflict_retry(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StoreError>(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_key_conflict_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let started = tokio::time::Instant::now();
        let result = with_conflict_retry(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(fk_error())
                } else {
                    Ok("inserted")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "inserted");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two pauses of two seconds each.
        assert_eq!(started.elapsed(), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = with_conflict_retry(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(fk_error())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            BillingError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.is_foreign_key_violation());
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = with_conflict_retry(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Database("connection reset".to_string()))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, BillingError::Store(_)));
    }
}
