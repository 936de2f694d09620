use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::retry::RetryPolicy;

/// How the work is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Items dispatched one at a time, in index order.
    #[default]
    SingleStream,
    /// Fixed-size chunks processed by concurrent lanes, tracked in a chunk ledger.
    ChunkedParallel,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::SingleStream => "single-stream",
            RunMode::ChunkedParallel => "chunked-parallel",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single-stream" | "single" | "sequential" => Ok(RunMode::SingleStream),
            "chunked-parallel" | "chunked" | "parallel" => Ok(RunMode::ChunkedParallel),
            _ => Err(format!("Unknown run mode: {}", s)),
        }
    }
}

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: String,
    pub mode: RunMode,
    /// Items per chunk in chunked-parallel mode.
    pub chunk_size: u64,
    /// Maximum number of items in flight at once.
    pub concurrency: usize,
    /// Work units buffered ahead of the committed position, per lane.
    pub prefetch_factor: usize,
    pub per_item_timeout: Duration,
    /// Pause after each item on a lane.
    pub inter_item_delay: Duration,
    pub retry: RetryPolicy,
    pub sink_retry: RetryPolicy,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: format!("run-{}", &Uuid::new_v4().to_string()[..8]),
            mode: RunMode::SingleStream,
            chunk_size: 100,
            concurrency: 4,
            prefetch_factor: 2,
            per_item_timeout: Duration::from_secs(120),
            inter_item_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            sink_retry: RetryPolicy::new(5)
                .with_base_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(30)),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        }
    }
}

impl RunConfig {
    pub fn with_run_id(mut self, id: impl Into<String>) -> Self {
        self.run_id = id.into();
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_prefetch_factor(mut self, factor: usize) -> Self {
        self.prefetch_factor = factor;
        self
    }

    pub fn with_per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = timeout;
        self
    }

    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_sink_retry(mut self, policy: RetryPolicy) -> Self {
        self.sink_retry = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, config: Option<CircuitBreakerConfig>) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Maximum work units dispatched but not yet committed.
    pub fn queue_depth(&self) -> usize {
        self.concurrency.saturating_mul(self.prefetch_factor).max(1)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigError("concurrency must be at least 1".into()));
        }
        if self.prefetch_factor == 0 {
            return Err(AppError::ConfigError(
                "prefetch factor must be at least 1".into(),
            ));
        }
        if self.mode == RunMode::ChunkedParallel && self.chunk_size == 0 {
            return Err(AppError::ConfigError("chunk size must be at least 1".into()));
        }
        if self.per_item_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "per-item timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
