use harvest_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::pg_chunks::PgChunkLedger;
use crate::pg_sink::PgResultSink;
use crate::pg_source::PgWorkSource;

/// Owns the connection pool, runs migrations and hands out ledgers by name.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub async fn work_source(&self, ledger: &str) -> Result<PgWorkSource, AppError> {
        PgWorkSource::open(self.pool.clone(), ledger).await
    }

    pub fn result_sink(&self, ledger: &str) -> PgResultSink {
        PgResultSink::new(self.pool.clone(), ledger)
    }

    pub fn chunk_ledger(&self, ledger: &str) -> PgChunkLedger {
        PgChunkLedger::new(self.pool.clone(), ledger)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
