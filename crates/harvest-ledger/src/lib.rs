pub mod chunks;
pub mod config;
pub mod csv_sink;
pub mod csv_source;
pub mod database;
pub mod pg_chunks;
pub mod pg_sink;
pub mod pg_source;

pub use chunks::{ChunkEntry, FileChunkLedger};
pub use config::DatabaseConfig;
pub use csv_sink::CsvResultSink;
pub use csv_source::{ColumnMapping, CsvWorkSource};
pub use database::Database;
pub use pg_chunks::PgChunkLedger;
pub use pg_sink::PgResultSink;
pub use pg_source::PgWorkSource;
