//! Bounded retry with exponential backoff around one network operation.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ServiceError, UploadError};

/// Status codes that signal a permanent client error and are never retried
/// (partial content mismatch, bad parameters, invalid/expired signature).
const PERMANENT_STATUS: &[u16] = &[206, 400, 403];

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(64);

/// Retry budgets and backoff for one network operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Retries granted after transport-level failures.
    pub max_network_retries: u32,
    /// Retries granted after non-success status codes.
    pub max_server_retries: u32,
    /// Backoff for attempt `n` is `delay_base^n` seconds; 0 disables sleeping.
    pub delay_base: u32,
}

/// Executes one network operation under dual retry budgets.
///
/// Transport failures (no status code received) and server failures
/// (non-success status) consume independent budgets. The consumed counts
/// stay readable after the call for observability and tests.
pub struct Retrier {
    config: RetryConfig,
    network_failures: u32,
    server_failures: u32,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            network_failures: 0,
            server_failures: 0,
        }
    }

    /// Transport failures consumed so far.
    pub fn network_failures(&self) -> u32 {
        self.network_failures
    }

    /// Server failures consumed so far.
    pub fn server_failures(&self) -> u32 {
        self.server_failures
    }

    /// Run `op` until it succeeds or a budget is exhausted.
    pub async fn run<T, Op, Fut>(&mut self, op: Op) -> Result<T, UploadError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.run_with_hook(op, || Ok(())).await
    }

    /// Like [`run`](Self::run), with `on_network_failure` invoked after each
    /// transport failure that will be retried, before the backoff sleep.
    /// A hook error aborts the operation immediately.
    pub async fn run_with_hook<T, Op, Fut, H>(
        &mut self,
        mut op: Op,
        mut on_network_failure: H,
    ) -> Result<T, UploadError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
        H: FnMut() -> Result<(), UploadError>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(ServiceError::Status { code, message }) if PERMANENT_STATUS.contains(&code) => {
                    return Err(UploadError::Request { code, message });
                }
                Err(ServiceError::Status { code, message }) => {
                    self.server_failures += 1;
                    if self.server_failures > self.config.max_server_retries {
                        return Err(UploadError::ServerRetriesExhausted { code, message });
                    }
                    warn!(code, failures = self.server_failures, "server error, will retry");
                }
                Err(ServiceError::Transport { message }) => {
                    self.network_failures += 1;
                    if self.network_failures > self.config.max_network_retries {
                        return Err(UploadError::NetworkRetriesExhausted { message });
                    }
                    warn!(failures = self.network_failures, %message, "transport failure, will retry");
                    on_network_failure()?;
                }
            }
            self.backoff(attempt).await;
            attempt += 1;
        }
    }

    async fn backoff(&self, attempt: u32) {
        if self.config.delay_base == 0 {
            return;
        }
        let secs: u64 = (self.config.delay_base as u64)
            .checked_pow(attempt)
            .unwrap_or(u64::MAX);
        let delay: Duration = std::cmp::min(Duration::from_secs(secs), MAX_BACKOFF);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_sleep(network: u32, server: u32) -> RetryConfig {
        RetryConfig {
            max_network_retries: network,
            max_server_retries: server,
            delay_base: 0,
        }
    }

    fn transport_err() -> ServiceError {
        ServiceError::Transport {
            message: "connection reset".to_string(),
        }
    }

    fn status_err(code: u16) -> ServiceError {
        ServiceError::Status {
            code,
            message: "server error".to_string(),
        }
    }

    #[tokio::test]
    async fn test_network_budget_exhaustion_counts_attempts() {
        let attempts = AtomicU32::new(0);
        let mut retrier = Retrier::new(no_sleep(3, 5));

        let result: Result<(), UploadError> = retrier
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(transport_err()) }
            })
            .await;

        assert!(matches!(result, Err(UploadError::NetworkRetriesExhausted { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(retrier.network_failures(), 4);
        assert_eq!(retrier.server_failures(), 0);
    }

    #[tokio::test]
    async fn test_server_budget_exhaustion_carries_last_status() {
        let mut retrier = Retrier::new(no_sleep(0, 2));

        let result: Result<(), UploadError> = retrier.run(|| async { Err(status_err(503)) }).await;

        match result {
            Err(UploadError::ServerRetriesExhausted { code, .. }) => assert_eq!(code, 503),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(retrier.server_failures(), 3);
    }

    #[tokio::test]
    async fn test_permanent_status_fails_immediately() {
        for code in [206u16, 400, 403] {
            let attempts = AtomicU32::new(0);
            let mut retrier = Retrier::new(no_sleep(5, 5));

            let result: Result<(), UploadError> = retrier
                .run(|| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move { Err(status_err(code)) }
                })
                .await;

            match result {
                Err(UploadError::Request { code: seen, .. }) => assert_eq!(seen, code),
                other => panic!("unexpected result: {other:?}"),
            }
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
            assert_eq!(retrier.network_failures(), 0);
            assert_eq!(retrier.server_failures(), 0);
        }
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let attempts = AtomicU32::new(0);
        let mut retrier = Retrier::new(no_sleep(5, 5));

        let result: Result<u32, UploadError> = retrier
            .run(|| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(transport_err())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(retrier.network_failures(), 2);
    }

    #[tokio::test]
    async fn test_hook_fires_per_retried_network_failure() {
        let hooks = AtomicU32::new(0);
        let attempts = AtomicU32::new(0);
        let mut retrier = Retrier::new(no_sleep(5, 5));

        let result: Result<(), UploadError> = retrier
            .run_with_hook(
                || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(transport_err())
                        } else {
                            Ok(())
                        }
                    }
                },
                || {
                    hooks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(hooks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hook_error_aborts() {
        let mut retrier = Retrier::new(no_sleep(5, 5));

        let result: Result<(), UploadError> = retrier
            .run_with_hook(
                || async { Err(transport_err()) },
                || Err(UploadError::NetworkUnusable { floor: 32 * 1024 }),
            )
            .await;

        assert!(matches!(result, Err(UploadError::NetworkUnusable { .. })));
        assert_eq!(retrier.network_failures(), 1);
    }

    #[tokio::test]
    async fn test_server_failures_do_not_fire_hook() {
        let hooks = AtomicU32::new(0);
        let mut retrier = Retrier::new(no_sleep(0, 2));

        let _: Result<(), UploadError> = retrier
            .run_with_hook(
                || async { Err(status_err(500)) },
                || {
                    hooks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;

        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }
}
