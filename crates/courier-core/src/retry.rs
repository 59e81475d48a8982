//! Bounded retry for broker calls and message handlers.
//!
//! A [`ResiliencePolicy`] describes how many times to try and how long to wait
//! between tries; a [`ResiliencePipeline`] runs an async operation under one.
//! Consumers keep two independent pipelines: one around "receive next message"
//! and a deliberately shallow one around "process this message".

use std::borrow::Cow;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result, RetryError};

/// Shape of the wait between consecutive attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Constant `delay` between every attempt
    #[default]
    None,
    /// `delay × n` after the n-th failed attempt
    Linear,
    /// `delay × 2^(n-1)` after the n-th failed attempt
    Exponential,
}

impl Backoff {
    /// Multiplier applied to the base delay after `attempt` (1-based) failed.
    pub fn factor(self, attempt: u32) -> u32 {
        let attempt = attempt.max(1);
        match self {
            Backoff::None => 1,
            Backoff::Linear => attempt,
            Backoff::Exponential => 2u32.saturating_pow(attempt - 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    /// Total tries including the first (must be at least 1)
    pub max_attempts: u32,
    /// Base delay in milliseconds
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Upper bound for a single wait, in milliseconds
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Backoff::Linear)
    }
}

impl ResiliencePolicy {
    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff,
            max_delay_ms: None,
        }
    }

    /// Single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Backoff::None)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(max_delay.as_millis() as u64);
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// How long to wait after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .delay_ms
            .saturating_mul(u64::from(self.backoff.factor(attempt)));

        match self.max_delay_ms {
            Some(max) => Duration::from_millis(delay_ms.min(max)),
            None => Duration::from_millis(delay_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(max) = self.max_delay_ms
            && max < self.delay_ms
        {
            return Err(Error::InvalidPolicy(format!(
                "max_delay_ms ({max}) must not be smaller than delay_ms ({})",
                self.delay_ms
            )));
        }
        Ok(())
    }
}

/// Runs an operation under a [`ResiliencePolicy`].
///
/// Every error counts as retryable. Cancellation is checked before each
/// attempt, after each failure and during backoff sleeps; once requested the
/// pipeline returns [`RetryError::Cancelled`] without starting another attempt.
#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    name: Cow<'static, str>,
    policy: ResiliencePolicy,
}

impl ResiliencePipeline {
    pub fn new(name: impl Into<Cow<'static, str>>, policy: ResiliencePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Execute `operation`, passing it the 1-based attempt number.
    ///
    /// On exhaustion the last error is returned to the caller; any fallback
    /// is the caller's job.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Debug + Display,
    {
        self.execute_if(operation, |_| true, cancel).await
    }

    /// Like [`execute`](Self::execute), but only errors accepted by
    /// `retryable` are retried. Any other error ends the run at once as
    /// [`RetryError::Exhausted`] with the attempts made so far.
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        retryable: P,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Debug + Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(pipeline = %self.name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            if !retryable(&error) {
                debug!(pipeline = %self.name, attempt, error = %error, "Error is not retryable");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                pipeline = %self.name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    /// Records when each attempt started.
    #[derive(Default)]
    struct Attempts(std::sync::Mutex<Vec<Instant>>);

    impl Attempts {
        fn mark(&self) {
            self.0.lock().unwrap().push(Instant::now());
        }

        fn gaps_ms(&self) -> Vec<u128> {
            let starts = self.0.lock().unwrap();
            starts
                .windows(2)
                .map(|w| (w[1] - w[0]).as_millis())
                .collect()
        }

        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    fn assert_gaps(actual: Vec<u128>, expected: &[u128]) {
        assert_eq!(actual.len(), expected.len(), "gaps: {actual:?}");
        for (gap, want) in actual.iter().zip(expected) {
            assert!(
                *gap >= *want && *gap <= *want + 5,
                "gap {gap}ms, expected about {want}ms ({actual:?})"
            );
        }
    }

    #[test]
    fn test_backoff_factors() {
        assert_eq!(Backoff::None.factor(1), 1);
        assert_eq!(Backoff::None.factor(5), 1);
        assert_eq!(Backoff::Linear.factor(1), 1);
        assert_eq!(Backoff::Linear.factor(3), 3);
        assert_eq!(Backoff::Exponential.factor(1), 1);
        assert_eq!(Backoff::Exponential.factor(2), 2);
        assert_eq!(Backoff::Exponential.factor(4), 8);
        assert_eq!(Backoff::Exponential.factor(40), u32::MAX);
    }

    #[test]
    fn test_delay_for_with_cap() {
        let policy = ResiliencePolicy::new(5, Duration::from_millis(500), Backoff::Exponential)
            .with_max_delay(Duration::from_millis(1500));

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1500));
    }

    #[test]
    fn test_policy_validation() {
        assert!(ResiliencePolicy::default().validate().is_ok());
        assert!(ResiliencePolicy::once().validate().is_ok());

        let zero = ResiliencePolicy::new(0, Duration::from_millis(10), Backoff::None);
        assert!(matches!(zero.validate(), Err(Error::InvalidPolicy(_))));

        let inverted = ResiliencePolicy::new(3, Duration::from_millis(100), Backoff::None)
            .with_max_delay(Duration::from_millis(50));
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_policy_deserialization_defaults() {
        let policy: ResiliencePolicy =
            serde_json::from_str(r#"{"max_attempts": 4, "delay_ms": 250}"#).unwrap();
        assert_eq!(policy.backoff, Backoff::None);
        assert_eq!(policy.max_delay_ms, None);

        let policy: ResiliencePolicy = serde_json::from_str(
            r#"{"max_attempts": 4, "delay_ms": 250, "backoff": "exponential"}"#,
        )
        .unwrap();
        assert_eq!(policy.backoff, Backoff::Exponential);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_without_retry() {
        let pipeline = ResiliencePipeline::new("process", ResiliencePolicy::default());
        let result: std::result::Result<u32, RetryError<String>> = pipeline
            .execute(|attempt| async move { Ok(attempt) }, &CancellationToken::new())
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_sleeps() {
        let attempts = Arc::new(Attempts::default());
        let pipeline = ResiliencePipeline::new(
            "process",
            ResiliencePolicy::new(3, Duration::from_millis(500), Backoff::Linear),
        );

        let result: std::result::Result<(), RetryError<String>> = pipeline
            .execute(
                |attempt| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.mark();
                        Err(format!("attempt {attempt} failed"))
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(RetryError::Exhausted {
                attempts: n,
                last_error,
            }) => {
                assert_eq!(n, 3);
                assert_eq!(last_error, "attempt 3 failed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_gaps(attempts.gaps_ms(), &[500, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_sleeps() {
        let attempts = Arc::new(Attempts::default());
        let pipeline = ResiliencePipeline::new(
            "receive",
            ResiliencePolicy::new(4, Duration::from_millis(500), Backoff::Exponential),
        );

        let result: std::result::Result<(), RetryError<&'static str>> = pipeline
            .execute(
                |_| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.mark();
                        Err("broker unavailable")
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 4, .. })
        ));
        assert_gaps(attempts.gaps_ms(), &[500, 1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = ResiliencePipeline::new(
            "process",
            ResiliencePolicy::new(3, Duration::from_millis(100), Backoff::None),
        );

        let result: std::result::Result<&'static str, RetryError<&'static str>> = pipeline
            .execute(
                |_| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err("transient")
                        } else {
                            Ok("done")
                        }
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = ResiliencePipeline::new(
            "receive",
            ResiliencePolicy::new(5, Duration::from_millis(500), Backoff::Exponential),
        );

        let started = Instant::now();
        let result: std::result::Result<(), RetryError<&'static str>> = pipeline
            .execute_if(
                |_| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err("transient")
                        } else {
                            Err("closed")
                        }
                    }
                },
                |e| *e == "transient",
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "closed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_aborts_before_next_attempt() {
        let attempts = Arc::new(Attempts::default());
        let cancel = CancellationToken::new();
        let pipeline = ResiliencePipeline::new(
            "process",
            ResiliencePolicy::new(3, Duration::from_millis(500), Backoff::Linear),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: std::result::Result<(), RetryError<String>> = pipeline
            .execute(
                |_| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.mark();
                        Err("boom".to_string())
                    }
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(attempts.count(), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let pipeline = ResiliencePipeline::new("receive", ResiliencePolicy::default());

        let result: std::result::Result<(), RetryError<String>> = pipeline
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                &cancel,
            )
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
