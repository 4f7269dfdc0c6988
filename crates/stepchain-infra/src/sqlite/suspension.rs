//! SQLite suspension store implementation.
//!
//! Implements `SuspensionStore` using sqlx with the split read/write pool.
//! The full record is stored as JSON; the consumption marker lives in its own
//! column so that consume is a single conditional UPDATE.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepchain_core::repository::SuspensionStore;
use stepchain_types::error::RepositoryError;
use stepchain_types::execution::{StoredSuspension, SuspensionRecord};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed suspension store.
#[derive(Clone)]
pub struct SqliteSuspensionStore {
    pool: DatabasePool,
}

impl SqliteSuspensionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

struct SuspensionRow {
    record: String,
    consumed_at: Option<String>,
}

impl SuspensionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            record: row.try_get("record")?,
            consumed_at: row.try_get("consumed_at")?,
        })
    }

    fn into_stored(self) -> Result<StoredSuspension, RepositoryError> {
        let record = decode_record(&self.record)?;
        let consumed_at = self.consumed_at.as_deref().map(parse_datetime).transpose()?;
        Ok(StoredSuspension { record, consumed_at })
    }
}

fn decode_record(json: &str) -> Result<SuspensionRecord, RepositoryError> {
    serde_json::from_str(json)
        .map_err(|e| RepositoryError::Query(format!("invalid suspension record: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// SuspensionStore implementation
// ---------------------------------------------------------------------------

impl SuspensionStore for SqliteSuspensionStore {
    async fn save(&self, record: &SuspensionRecord) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(record)
            .map_err(|e| RepositoryError::Query(format!("failed to encode record: {e}")))?;

        // A consumed row may be replaced; an unconsumed one may not.
        let result = sqlx::query(
            r#"INSERT INTO suspensions
               (execution_id, chain_id, step_index, step_id, leaf_step_id, reason,
                record, wake_at_ms, suspended_at, consumed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
               ON CONFLICT(execution_id) DO UPDATE SET
                 chain_id = excluded.chain_id,
                 step_index = excluded.step_index,
                 step_id = excluded.step_id,
                 leaf_step_id = excluded.leaf_step_id,
                 reason = excluded.reason,
                 record = excluded.record,
                 wake_at_ms = excluded.wake_at_ms,
                 suspended_at = excluded.suspended_at,
                 consumed_at = NULL
               WHERE suspensions.consumed_at IS NOT NULL"#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.chain_id)
        .bind(record.step_index as i64)
        .bind(&record.step_id)
        .bind(&record.leaf_step_id)
        .bind(&record.reason)
        .bind(&json)
        .bind(record.wake_at.map(|at| at.timestamp_millis()))
        .bind(format_datetime(&record.suspended_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already has an unconsumed suspension",
                record.execution_id
            )));
        }

        tracing::debug!(
            execution_id = %record.execution_id,
            step_id = %record.step_id,
            "suspension saved"
        );
        Ok(())
    }

    async fn load_and_consume(&self, execution_id: &Uuid) -> Result<SuspensionRecord, RepositoryError> {
        let id = execution_id.to_string();

        let row = sqlx::query(
            r#"UPDATE suspensions SET consumed_at = ?
               WHERE execution_id = ? AND consumed_at IS NULL
               RETURNING record"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(&id)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if let Some(row) = row {
            let json: String = row
                .try_get("record")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            return decode_record(&json);
        }

        // Nothing was updated: the row is either missing or already consumed.
        let exists = sqlx::query("SELECT 1 FROM suspensions WHERE execution_id = ?")
            .bind(&id)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match exists {
            Some(_) => Err(RepositoryError::Consumed),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn peek(&self, execution_id: &Uuid) -> Result<Option<StoredSuspension>, RepositoryError> {
        let row = sqlx::query("SELECT record, consumed_at FROM suspensions WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(r) => {
                let row = SuspensionRow::from_row(&r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(row.into_stored()?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, execution_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM suspensions WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<SuspensionRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT record FROM suspensions
               WHERE consumed_at IS NULL AND wake_at_ms IS NOT NULL AND wake_at_ms <= ?
               ORDER BY wake_at_ms ASC"#,
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                let json: String = r
                    .try_get("record")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                decode_record(&json)
            })
            .collect()
    }
}
