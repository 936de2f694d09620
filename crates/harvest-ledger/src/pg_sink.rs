use chrono::{DateTime, Utc};
use harvest_core::error::AppError;
use harvest_core::models::{RecordOutcome, ResultRecord};
use harvest_core::traits::ResultSink;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use std::collections::BTreeMap;

/// Result records stored in PostgreSQL under a named ledger.
///
/// Rows are keyed by `(ledger, item_index)` and inserted with
/// `ON CONFLICT DO NOTHING`, so a retried append never duplicates a row.
#[derive(Clone)]
pub struct PgResultSink {
    pool: Pool<Postgres>,
    ledger: String,
}

impl PgResultSink {
    pub fn new(pool: PgPool, ledger: impl Into<String>) -> Self {
        Self {
            pool,
            ledger: ledger.into(),
        }
    }

    pub fn ledger(&self) -> &str {
        &self.ledger
    }

    /// Stored records in index order, for export and inspection.
    pub async fn records(&self, start: u64, limit: u64) -> Result<Vec<ResultRecord>, AppError> {
        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT item_index, category, target, fields, status, error, attempts, processed_at
            FROM result_records
            WHERE ledger = $1 AND item_index >= $2
            ORDER BY item_index
            LIMIT $3
            "#,
        )
        .bind(&self.ledger)
        .bind(start as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Connection-level failures are worth retrying; constraint and type
/// errors are not.
fn sink_error(error: sqlx::Error) -> AppError {
    let retryable = match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001" | "40P01" | "57P01" | "08006"))
        }
        _ => false,
    };
    AppError::SinkError {
        message: error.to_string(),
        retryable,
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    item_index: i64,
    category: String,
    target: String,
    fields: Json<BTreeMap<String, String>>,
    status: String,
    error: Option<String>,
    attempts: i32,
    processed_at: DateTime<Utc>,
}

impl From<ResultRow> for ResultRecord {
    fn from(row: ResultRow) -> Self {
        let outcome = match row.status.as_str() {
            "ok" => RecordOutcome::Ok,
            _ => {
                let error = row.error.unwrap_or_default();
                let (kind, message) = error.split_once(": ").unwrap_or(("error", error.as_str()));
                RecordOutcome::Failed {
                    kind: kind.to_string(),
                    message: message.to_string(),
                }
            }
        };
        ResultRecord {
            index: row.item_index as u64,
            category: row.category,
            target: row.target,
            fields: row.fields.0,
            outcome,
            attempts: row.attempts.max(0) as u32,
            processed_at: row.processed_at,
        }
    }
}

impl ResultSink for PgResultSink {
    async fn ensure_schema(&self, headers: &[String]) -> Result<(), AppError> {
        let (Json(stored),): (Json<Vec<String>>,) = sqlx::query_as(
            r#"
            WITH inserted AS (
                INSERT INTO sink_schemas (ledger, headers)
                VALUES ($1, $2)
                ON CONFLICT (ledger) DO NOTHING
                RETURNING headers
            )
            SELECT headers FROM inserted
            UNION ALL
            SELECT headers FROM sink_schemas WHERE ledger = $1
            LIMIT 1
            "#,
        )
        .bind(&self.ledger)
        .bind(Json(headers))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if stored != headers {
            return Err(AppError::ConfigError(format!(
                "Result ledger '{}' has columns [{}] but this run writes [{}]",
                self.ledger,
                stored.join(", "),
                headers.join(", ")
            )));
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM result_records WHERE ledger = $1")
                .bind(&self.ledger)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(count as u64)
    }

    async fn append(&self, record: &ResultRecord) -> Result<(), AppError> {
        let error = match &record.outcome {
            RecordOutcome::Ok => None,
            failed => Some(failed.error_text()),
        };
        let result = sqlx::query(
            r#"
            INSERT INTO result_records
                (ledger, item_index, category, target, fields, status, error, attempts, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (ledger, item_index) DO NOTHING
            "#,
        )
        .bind(&self.ledger)
        .bind(record.index as i64)
        .bind(&record.category)
        .bind(&record.target)
        .bind(Json(&record.fields))
        .bind(record.outcome.as_str())
        .bind(error)
        .bind(record.attempts as i32)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await
        .map_err(sink_error)?;

        if result.rows_affected() == 0 {
            tracing::debug!(ledger = %self.ledger, index = record.index, "Result already stored");
        }
        Ok(())
    }
}
