//! Exponential backoff with jitter around fallible async operations.
//!
//! The default classification retries commit races only; callers widen it
//! with [`Retry::retry_if`] when a backend is known to throw transient
//! faults worth another attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{DlResult, Error};

/// Cooperative cancellation checked between attempts. Cloning shares the
/// underlying flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Outcome counters for one [`Retry::run`] invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryMetrics {
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// Attempts beyond the first.
    pub retries: u32,
    pub succeeded: bool,
    pub total_delay: Duration,
    pub elapsed: Duration,
}

type RetryPredicate = Box<dyn Fn(&Error) -> bool + Send + Sync>;
type OnRetry<'a> = Box<dyn FnMut(u32, &Error) -> bool + Send + 'a>;
type OnSuccess<'a> = Box<dyn FnMut(&RetryMetrics) + Send + 'a>;
type OnFailure<'a> = Box<dyn FnMut(&Error, &RetryMetrics) + Send + 'a>;

/// Builder for a retried operation.
pub struct Retry<'a> {
    config: RetryConfig,
    is_retryable: Option<RetryPredicate>,
    abort: Option<AbortSignal>,
    on_retry: Option<OnRetry<'a>>,
    on_success: Option<OnSuccess<'a>>,
    on_failure: Option<OnFailure<'a>>,
}

impl<'a> Retry<'a> {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            is_retryable: None,
            abort: None,
            on_retry: None,
            on_success: None,
            on_failure: None,
        }
    }

    /// Override the retryable classification. The default is
    /// [`Error::is_retryable`].
    pub fn retry_if(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Some(Box::new(predicate));
        self
    }

    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Invoked before each retry sleep with the upcoming attempt number and
    /// the error that triggered it. Returning `false` aborts the loop.
    pub fn on_retry(mut self, callback: impl FnMut(u32, &Error) -> bool + Send + 'a) -> Self {
        self.on_retry = Some(Box::new(callback));
        self
    }

    pub fn on_success(mut self, callback: impl FnMut(&RetryMetrics) + Send + 'a) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure(mut self, callback: impl FnMut(&Error, &RetryMetrics) + Send + 'a) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let raw = base * self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = raw.min(self.config.max_delay.as_millis() as f64);
        let jittered = if self.config.jitter {
            let spread: f64 = rand::thread_rng().gen_range(-1.0..1.0);
            capped * (1.0 + self.config.jitter_factor * spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Drive `op` until it succeeds, exhausts `max_retries`, is aborted, or
    /// fails with a non-retryable error.
    pub async fn run<T, F, Fut>(mut self, mut op: F) -> DlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DlResult<T>>,
    {
        let started = Instant::now();
        let mut metrics = RetryMetrics::default();
        loop {
            metrics.attempts += 1;
            match op().await {
                Ok(value) => {
                    metrics.succeeded = true;
                    metrics.elapsed = started.elapsed();
                    if let Some(cb) = self.on_success.as_mut() {
                        cb(&metrics);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = match &self.is_retryable {
                        Some(predicate) => predicate(&err),
                        None => err.is_retryable(),
                    };
                    let attempts_left = metrics.retries < self.config.max_retries;
                    let aborted = self
                        .abort
                        .as_ref()
                        .map(AbortSignal::is_aborted)
                        .unwrap_or(false);
                    if !retryable || !attempts_left || aborted {
                        metrics.elapsed = started.elapsed();
                        if let Some(cb) = self.on_failure.as_mut() {
                            cb(&err, &metrics);
                        }
                        return Err(err);
                    }
                    metrics.retries += 1;
                    if let Some(cb) = self.on_retry.as_mut() {
                        if !cb(metrics.attempts + 1, &err) {
                            metrics.elapsed = started.elapsed();
                            if let Some(cb) = self.on_failure.as_mut() {
                                cb(&err, &metrics);
                            }
                            return Err(err);
                        }
                    }
                    let delay = self.delay_for_attempt(metrics.retries);
                    debug!(
                        attempt = metrics.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after backoff"
                    );
                    metrics.total_delay += delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Shorthand for the common case: default classification, no callbacks.
pub async fn with_retry<T, F, Fut>(config: RetryConfig, op: F) -> DlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DlResult<T>>,
{
    Retry::new(config).run(op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_on_attempt_k_reports_attempts_k() {
        let calls = AtomicU32::new(0);
        let mut successes = 0u32;
        let mut observed_attempts = 0;
        let result = Retry::new(fast_config(5))
            .on_success(|m| {
                successes += 1;
                observed_attempts = m.attempts;
            })
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::Concurrency { expected: n as u64, actual: n as u64 })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(successes, 1);
        assert_eq!(observed_attempts, 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let err = Retry::new(fast_config(5))
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::validation("bad input")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries() {
        let calls = AtomicU32::new(0);
        let mut failure_metrics = RetryMetrics::default();
        let err = Retry::new(fast_config(2))
            .on_failure(|_, m| failure_metrics = m.clone())
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Concurrency { expected: 1, actual: 1 }) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failure_metrics.attempts, 3);
        assert_eq!(failure_metrics.retries, 2);
        assert!(!failure_metrics.succeeded);
    }

    #[tokio::test]
    async fn on_retry_false_aborts() {
        let calls = AtomicU32::new(0);
        let err = Retry::new(fast_config(5))
            .on_retry(|_, _| false)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Concurrency { expected: 1, actual: 1 }) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_signal_stops_between_attempts() {
        let signal = AbortSignal::new();
        signal.abort();
        let calls = AtomicU32::new(0);
        let err = Retry::new(fast_config(5))
            .with_abort(signal)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Concurrency { expected: 1, actual: 1 }) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_growth_and_cap() {
        let retry = Retry::new(RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: false,
            jitter_factor: 0.0,
        });
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(350));
    }
}
