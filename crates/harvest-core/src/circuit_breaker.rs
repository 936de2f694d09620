//! Circuit breaker shared by all extraction lanes of a run.
//!
//! When the remote side keeps timing out or rate-limiting, lanes stop
//! hammering it and park until a probe is allowed.
//!
//! ```text
//! CLOSED --[N tripping failures]--> OPEN --[recovery timeout]--> HALF_OPEN
//!   ^                                 ^                              |
//!   |                                 +-----------[failure]----------+
//!   +------------------------[M successes]---------------------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive tripping failures before opening.
    pub failure_threshold: u32,
    /// Successful probes in half-open state needed to close.
    pub success_threshold: u32,
    /// Wait before an open circuit lets a probe through.
    pub recovery_timeout: Duration,
    /// Recovery timeout multiplier applied when a rate limit opened the circuit.
    pub rate_limit_backoff_multiplier: f32,
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    probes_ok: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    recovery_timeout: Duration,
}

impl BreakerState {
    fn retry_after(&self) -> Duration {
        match self.opened_at {
            Some(t) => self.recovery_timeout.saturating_sub(t.elapsed()),
            None => self.recovery_timeout,
        }
    }
}

/// Snapshot for logging.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub retry_after: Option<Duration>,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Rejected without running the operation.
    Open { name: String, retry_after: Duration },
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => write!(
                f,
                "Circuit breaker '{}' is open, retry after {}ms",
                name,
                retry_after.as_millis()
            ),
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerState {
            state: CircuitState::Closed,
            failures: 0,
            probes_ok: 0,
            opened_at: None,
            last_error: None,
            recovery_timeout: config.recovery_timeout,
        };
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            last_error: inner.last_error.clone(),
            retry_after: (inner.state == CircuitState::Open).then(|| inner.retry_after()),
        }
    }

    /// `Err(retry_after)` while the circuit rejects calls.
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Open => Err(inner.retry_after()),
            _ => Ok(()),
        }
    }

    /// Run `operation` unless the circuit is open, and record its result.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if let Err(retry_after) = self.check() {
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after,
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {}
        }
        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probes_ok += 1;
                if inner.probes_ok >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "Circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.probes_ok = 0;
                    inner.last_error = None;
                    inner.recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock();
        inner.last_error = Some(error.to_string());

        let open = match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                inner.failures >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if !open {
            return;
        }

        if error.is_rate_limit() {
            let stretched = inner
                .recovery_timeout
                .mul_f32(self.config.rate_limit_backoff_multiplier);
            inner.recovery_timeout = stretched.min(self.config.max_recovery_timeout);
        }
        tracing::warn!(
            circuit = %self.name,
            failures = inner.failures,
            error = %error,
            recovery_ms = inner.recovery_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_ok = 0;
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.probes_ok = 0;
        inner.opened_at = None;
        inner.last_error = None;
        inner.recovery_timeout = self.config.recovery_timeout;
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened) = inner.opened_at
            && opened.elapsed() >= inner.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit breaker half-open, probing");
            inner.state = CircuitState::HalfOpen;
            inner.probes_ok = 0;
        }
    }
}
