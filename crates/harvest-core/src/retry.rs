//! Bounded exponential backoff, for extraction and for sink writes.

use std::future::Future;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::AppError;
use crate::models::{ExtractedFields, WorkItem};
use crate::traits::Extractor;

/// Retry configuration with exponential backoff.
///
/// Retry `n` (1-indexed) waits `base_delay * multiplier^(n-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Fail on the first error.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// The last error of an operation that ran out of attempts (or hit a
/// non-retryable error).
#[derive(Debug)]
pub struct Exhausted {
    pub error: AppError,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt <= policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(Exhausted {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}

/// Result of running one item through [`RetryingExtractor`].
#[derive(Debug)]
pub enum ItemOutcome {
    Extracted {
        fields: ExtractedFields,
        attempts: u32,
    },
    /// Gave up on the item. `retriable` is true when transient failures
    /// exhausted the retry budget, false for permanent failures.
    Failed {
        error: AppError,
        attempts: u32,
        retriable: bool,
    },
}

/// Wraps an [`Extractor`] with a hard per-attempt timeout, an optional
/// circuit breaker and a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryingExtractor<E> {
    inner: E,
    policy: RetryPolicy,
    timeout: Duration,
    circuit: Option<CircuitBreaker>,
}

impl<E: Extractor> RetryingExtractor<E> {
    pub fn new(inner: E, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
            circuit: None,
        }
    }

    pub fn with_circuit_breaker(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = Some(circuit);
        self
    }

    pub fn fields(&self) -> &[&str] {
        self.inner.fields()
    }

    /// Extract `item`, retrying transient failures. Never returns an error:
    /// every item ends as extracted fields or a terminal failure.
    pub async fn run(&self, item: &WorkItem) -> ItemOutcome {
        let mut attempts = 0;
        loop {
            let result = match &self.circuit {
                Some(circuit) => match circuit.call(|| self.attempt(item)).await {
                    Ok(fields) => Ok(fields),
                    Err(CircuitBreakerError::Inner(e)) => Err(e),
                    Err(CircuitBreakerError::Open { retry_after, .. }) => {
                        // Parked calls do not consume the retry budget.
                        tracing::debug!(
                            index = item.index,
                            wait_ms = retry_after.as_millis() as u64,
                            "Circuit open, lane parked"
                        );
                        tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                        continue;
                    }
                },
                None => self.attempt(item).await,
            };
            attempts += 1;

            match result {
                Ok(fields) => return ItemOutcome::Extracted { fields, attempts },
                Err(error) if !error.is_retryable() => {
                    return ItemOutcome::Failed {
                        error,
                        attempts,
                        retriable: false,
                    };
                }
                Err(error) if attempts > self.policy.max_retries => {
                    return ItemOutcome::Failed {
                        error,
                        attempts,
                        retriable: true,
                    };
                }
                Err(error) => {
                    let delay = self.policy.delay_for_attempt(attempts);
                    tracing::warn!(
                        index = item.index,
                        url = %item.target,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Extraction failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, item: &WorkItem) -> Result<ExtractedFields, AppError> {
        match tokio::time::timeout(self.timeout, self.inner.extract(item, self.timeout)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.timeout)),
        }
    }
}
