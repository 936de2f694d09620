use chrono::{DateTime, Utc};
use harvest_core::chunk::{Chunk, ChunkId, ChunkStatus};
use harvest_core::error::AppError;
use harvest_core::traits::ChunkLedger;
use sqlx::{PgPool, Pool, Postgres};

use crate::chunks::ChunkEntry;

/// Chunk statuses stored in PostgreSQL under a named ledger.
#[derive(Clone)]
pub struct PgChunkLedger {
    pool: Pool<Postgres>,
    ledger: String,
}

impl PgChunkLedger {
    pub fn new(pool: PgPool, ledger: impl Into<String>) -> Self {
        Self {
            pool,
            ledger: ledger.into(),
        }
    }

    /// All known chunks ordered by start index.
    pub async fn entries(&self) -> Result<Vec<ChunkEntry>, AppError> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT chunk_start, chunk_end, status, updated_at
            FROM chunk_ledger
            WHERE ledger = $1
            ORDER BY chunk_start
            "#,
        )
        .bind(&self.ledger)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(ChunkEntry::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    chunk_start: i64,
    chunk_end: i64,
    status: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChunkRow> for ChunkEntry {
    type Error = AppError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        let chunk = Chunk::new(row.chunk_start as u64, row.chunk_end as u64);
        Ok(ChunkEntry {
            id: chunk.id().to_string(),
            start: chunk.start,
            end: chunk.end,
            status: row.status.parse().map_err(AppError::LedgerError)?,
            updated_at: row.updated_at,
        })
    }
}

impl ChunkLedger for PgChunkLedger {
    async fn status(&self, id: ChunkId) -> Result<Option<ChunkStatus>, AppError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM chunk_ledger WHERE ledger = $1 AND chunk_start = $2",
        )
        .bind(&self.ledger)
        .bind(id.start() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(|(status,)| status.parse().map_err(AppError::LedgerError))
            .transpose()
    }

    async fn set_status(&self, chunk: &Chunk, status: ChunkStatus) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO chunk_ledger (ledger, chunk_start, chunk_end, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ledger, chunk_start) DO UPDATE
            SET chunk_end = EXCLUDED.chunk_end,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(&self.ledger)
        .bind(chunk.start as i64)
        .bind(chunk.end as i64)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn mark_all_done(&self, chunks: &[Chunk]) -> Result<(), AppError> {
        let starts: Vec<i64> = chunks.iter().map(|c| c.start as i64).collect();
        let ends: Vec<i64> = chunks.iter().map(|c| c.end as i64).collect();
        sqlx::query(
            r#"
            INSERT INTO chunk_ledger (ledger, chunk_start, chunk_end, status)
            SELECT $1, chunk_start, chunk_end, $4
            FROM UNNEST($2::BIGINT[], $3::BIGINT[]) AS batch(chunk_start, chunk_end)
            ON CONFLICT (ledger, chunk_start) DO UPDATE
            SET chunk_end = EXCLUDED.chunk_end,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(&self.ledger)
        .bind(&starts)
        .bind(&ends)
        .bind(ChunkStatus::Done.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }
}
