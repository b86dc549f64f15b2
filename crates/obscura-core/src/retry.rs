//! Retry orchestration.
//!
//! Classification drives retry, never the call site: an operation is retried
//! only while its error's `RecoveryPolicy` says it can recover, and the
//! outcome is returned as a record rather than thrown upward.

use std::future::Future;
use std::time::Instant;

use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS, RETRY_DELAY_CAP_MS};
use crate::error::{ErrorContext, MixError};

/// Caller-chosen bounds layered on top of per-error recovery policy.
#[derive(Clone, Copy, Debug)]
pub struct RetryStrategy {
    /// Hard ceiling on attempts regardless of what the error permits.
    pub max_attempts: u32,
    /// Linear delay unit: attempt `n` waits `n × delay_ms` (capped).
    pub delay_ms: u64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1_000,
        }
    }
}

/// The result record of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<MixError>,
    pub attempts: u32,
    pub total_ms: u64,
}

/// Run `op` until it succeeds, its error stops being recoverable, or the
/// attempt budget runs out. The delay between attempts is linear
/// (`delay_ms × attempt`, capped) per the recovery contract.
pub async fn execute_with_retry<T, F, Fut>(
    context: &ErrorContext,
    strategy: RetryStrategy,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, MixError>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match op(attempts).await {
            Ok(value) => {
                return RetryOutcome {
                    success: true,
                    result: Some(value),
                    error: None,
                    attempts,
                    total_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(err) => {
                let recovery = err.recovery();
                let budget = strategy.max_attempts.min(recovery.max_retries + 1);
                if !recovery.can_recover || attempts >= budget {
                    if recovery.can_recover {
                        warn!(
                            component = %context.component,
                            operation = %context.operation,
                            attempts,
                            error = %err,
                            "retry budget exhausted"
                        );
                    }
                    return RetryOutcome {
                        success: false,
                        result: None,
                        error: Some(err),
                        attempts,
                        total_ms: started.elapsed().as_millis() as u64,
                    };
                }

                let unit = strategy.delay_ms.max(recovery.retry_delay_ms);
                let delay = (unit * attempts as u64).min(RETRY_DELAY_CAP_MS);
                debug!(
                    component = %context.component,
                    operation = %context.operation,
                    attempt = attempts,
                    delay_ms = delay,
                    error = %err,
                    "retrying after transient error"
                );
                sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// Exponential backoff for long-running waits (deposit polling, edge
/// reprocessing): base 1 s doubling to a 60 s cap. Jitter is the caller's
/// concern so this stays deterministic and testable.
pub fn exponential_backoff_ms(attempt: u32) -> u64 {
    let shifted = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    shifted.min(BACKOFF_CAP_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try() {
        let ctx = ErrorContext::new("test", "noop");
        let out = execute_with_retry(&ctx, RetryStrategy::default(), |_| async {
            Ok::<_, MixError>(42u32)
        })
        .await;
        assert!(out.success);
        assert_eq!(out.result, Some(42));
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let ctx = ErrorContext::new("test", "flaky");
        let calls = AtomicU32::new(0);
        let out = execute_with_retry(
            &ctx,
            RetryStrategy {
                max_attempts: 5,
                delay_ms: 1,
            },
            |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MixError::Network("flap".into()))
                } else {
                    Ok(7u32)
                }
            },
        )
        .await;
        assert!(out.success);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn non_recoverable_fails_fast() {
        let ctx = ErrorContext::new("test", "reject");
        let calls = AtomicU32::new(0);
        let out = execute_with_retry(
            &ctx,
            RetryStrategy {
                max_attempts: 5,
                delay_ms: 1,
            },
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(MixError::OutputSharesMismatch { got: 1 })
            },
        )
        .await;
        assert!(!out.success);
        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        assert_eq!(exponential_backoff_ms(0), 1_000);
        assert_eq!(exponential_backoff_ms(1), 2_000);
        assert_eq!(exponential_backoff_ms(5), 32_000);
        assert_eq!(exponential_backoff_ms(6), 60_000);
        assert_eq!(exponential_backoff_ms(32), 60_000);
    }
}
