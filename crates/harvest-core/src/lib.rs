pub mod chunk;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod reporter;
pub mod resume;
pub mod retry;
pub mod testutil;
pub mod traits;

pub use chunk::{Chunk, ChunkId, ChunkStatus, Chunks, partition};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use config::{RunConfig, RunMode};
pub use error::AppError;
pub use models::{ExtractedFields, ResultRecord, WorkItem, output_headers};
pub use pool::{Pipeline, RunSummary};
pub use reporter::{PipelineEvent, PipelineReporter, TracingReporter};
pub use resume::{ResumePoint, compute_resume_index, resume_point};
pub use retry::{RetryPolicy, RetryingExtractor, retry_with_backoff};
pub use traits::{ChunkLedger, Extractor, Fetcher, NoChunkLedger, ResultSink, WorkSource};
