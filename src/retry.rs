//! Centralised retry/backoff helper (§4.8.3, §9 design note: "centralise in
//! a helper that takes `(ctx, config, op)` and records a `Result{success,
//! output, retry_count, error}`").
//!
//! Grounded in the teacher crate's simple fixed-attempt retry loops
//! (scattered per-provider in `llms/providers/*`), generalized here into one
//! shared helper with exponential backoff, a capped delay, and jitter, used
//! identically by `tools::ToolRegistry::execute` (tool calls) and
//! `agent::AgentRunner` (model calls) so both retry policies stay in sync
//! with §7's "transient vs. fatal is a property of the error kind."

use std::time::Duration;

use rand::Rng;

use crate::error::CoreError;
use crate::metrics::MetricsCollector;

/// Exponential backoff with jitter, capped attempt count (§4.8.3: "initial,
/// max, multiplier, jitter... attempt count capped by max_attempts").
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay randomised away, e.g. `0.2` jitters
    /// the delay by up to ±20%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let spread = capped * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped + offset).max(0.0))
    }
}

/// The outcome of a retried operation, matching §9's `Result{success,
/// output, retry_count, error}` shape.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub output: Option<T>,
    pub retry_count: u32,
    pub error: Option<CoreError>,
}

/// Run `op` up to `config.max_attempts` times, retrying only
/// `CoreError::is_transient` failures with exponential backoff + jitter
/// between attempts. Non-transient errors return immediately on the first
/// failure (§7: "transient vs. fatal is a property of the error kind").
///
/// Records attempt/success/failure/retry counts into `metrics` under
/// `operation`, including `success_after_retry` (testable property 13).
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    metrics: &MetricsCollector,
    operation: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoreError>>,
{
    let mut last_err: Option<CoreError> = None;
    for attempt in 0..config.max_attempts.max(1) {
        metrics.record_attempt(operation);
        match op().await {
            Ok(value) => {
                metrics.record_success(operation, attempt);
                return RetryOutcome {
                    success: true,
                    output: Some(value),
                    retry_count: attempt,
                    error: None,
                };
            }
            Err(e) => {
                let transient = e.is_transient();
                last_err = Some(e);
                if !transient || attempt + 1 >= config.max_attempts {
                    metrics.record_failure(operation, attempt);
                    return RetryOutcome {
                        success: false,
                        output: None,
                        retry_count: attempt,
                        error: last_err,
                    };
                }
                tokio::time::sleep(config.delay_for(attempt)).await;
            }
        }
    }

    metrics.record_failure(operation, config.max_attempts.saturating_sub(1));
    RetryOutcome {
        success: false,
        output: None,
        retry_count: config.max_attempts.saturating_sub(1),
        error: last_err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_two_transient_failures() {
        let metrics = MetricsCollector::new();
        let config = RetryConfig {
            max_attempts: 3,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 1.0,
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(&config, &metrics, "tool.flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::TransientStore("boom".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.output, Some(42));
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snap = metrics.snapshot("tool.flaky");
        assert_eq!(snap.attempts, 3);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.success_after_retry, 1);
    }

    #[tokio::test]
    async fn non_transient_error_is_not_retried() {
        let metrics = MetricsCollector::new();
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_with_backoff(&config, &metrics, "tool.fatal", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::Data("malformed".to_string())) }
        })
        .await;

        assert!(!outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.error, Some(CoreError::Data(_))));
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_transient_failure() {
        let metrics = MetricsCollector::new();
        let config = RetryConfig {
            max_attempts: 3,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            multiplier: 1.0,
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_with_backoff(&config, &metrics, "tool.always_fails", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::TransientModel("down".to_string())) }
        })
        .await;

        assert!(!outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snap = metrics.snapshot("tool.always_fails");
        assert_eq!(snap.failures, 1);
    }
}
