use std::collections::BTreeMap;

use harvest_core::error::AppError;
use harvest_core::models::WorkItem;
use harvest_core::traits::WorkSource;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};

/// Work items stored in PostgreSQL under a named ledger.
#[derive(Clone)]
pub struct PgWorkSource {
    pool: Pool<Postgres>,
    ledger: String,
    columns: Vec<String>,
}

impl PgWorkSource {
    /// Open an existing work ledger.
    pub async fn open(pool: PgPool, ledger: impl Into<String>) -> Result<Self, AppError> {
        let ledger = ledger.into();
        let columns: Option<(Json<Vec<String>>,)> =
            sqlx::query_as("SELECT columns FROM work_ledgers WHERE ledger = $1")
                .bind(&ledger)
                .fetch_optional(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let Some((Json(columns),)) = columns else {
            return Err(AppError::ConfigError(format!(
                "Work ledger '{ledger}' does not exist. Import items first."
            )));
        };
        Ok(Self {
            pool,
            ledger,
            columns,
        })
    }

    /// Create the ledger if needed and insert `items`. Items already present
    /// at the same index are left untouched. Returns the number inserted.
    pub async fn import(
        pool: &PgPool,
        ledger: &str,
        columns: &[String],
        items: &[WorkItem],
    ) -> Result<u64, AppError> {
        let db = |e: sqlx::Error| AppError::DatabaseError(e.to_string());
        let mut tx = pool.begin().await.map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO work_ledgers (ledger, columns)
            VALUES ($1, $2)
            ON CONFLICT (ledger) DO NOTHING
            "#,
        )
        .bind(ledger)
        .bind(Json(columns))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let (Json(existing),): (Json<Vec<String>>,) =
            sqlx::query_as("SELECT columns FROM work_ledgers WHERE ledger = $1")
                .bind(ledger)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
        if existing != columns {
            return Err(AppError::ConfigError(format!(
                "Work ledger '{ledger}' has columns [{}], import has [{}]",
                existing.join(", "),
                columns.join(", ")
            )));
        }

        let mut inserted = 0;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO work_items (ledger, item_index, category, target, fields)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (ledger, item_index) DO NOTHING
                "#,
            )
            .bind(ledger)
            .bind(item.index as i64)
            .bind(&item.category)
            .bind(&item.target)
            .bind(Json(&item.fields))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(db)?;
        tracing::debug!(ledger, inserted, "Imported work items");
        Ok(inserted)
    }

    pub fn ledger(&self) -> &str {
        &self.ledger
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    item_index: i64,
    category: String,
    target: String,
    fields: Json<BTreeMap<String, String>>,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        WorkItem {
            index: row.item_index as u64,
            category: row.category,
            target: row.target,
            fields: row.fields.0,
        }
    }
}

impl WorkSource for PgWorkSource {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    async fn total(&self) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_items WHERE ledger = $1")
            .bind(&self.ledger)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(count as u64)
    }

    async fn get(&self, index: u64) -> Result<WorkItem, AppError> {
        self.get_range(index, index + 1)
            .await?
            .pop()
            .ok_or_else(|| AppError::LedgerError(format!("item {index} not found")))
    }

    async fn get_range(&self, start: u64, end: u64) -> Result<Vec<WorkItem>, AppError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT item_index, category, target, fields
            FROM work_items
            WHERE ledger = $1 AND item_index >= $2 AND item_index < $3
            ORDER BY item_index
            "#,
        )
        .bind(&self.ledger)
        .bind(start as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if rows.len() as u64 != end - start {
            return Err(AppError::LedgerError(format!(
                "work ledger '{}' is missing items in {start}..{end} (found {})",
                self.ledger,
                rows.len()
            )));
        }
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
