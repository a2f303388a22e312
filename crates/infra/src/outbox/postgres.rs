//! Postgres-backed outbox table.
//!
//! ## Schema
//!
//! One `outbox_events` table shared by every service; each worker only reads rows whose
//! `source_service` matches its own. `ensure_schema()` creates the table and the
//! `(source_service, status, created_at)` index the poll query runs on.
//!
//! ## Error Mapping
//!
//! | SQLx Error | OutboxStoreError |
//! |------------|------------------|
//! | Database | `Database` |
//! | PoolClosed / PoolTimedOut / Io / Tls | `Unavailable` |
//! | ColumnDecode / Decode | `Corrupt` |
//! | Other | `Database` |
//!
//! ## Atomic writes
//!
//! [`PostgresOutboxStore::insert_in_tx`] writes the row inside a caller-owned
//! transaction, so a business change and the event announcing it commit together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use hireflow_core::OutboxEventId;

use super::record::{NewOutboxEvent, OutboxEventRow, OutboxStatus};
use super::store::{OutboxStore, OutboxStoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id             UUID PRIMARY KEY,
    event_type     TEXT NOT NULL,
    payload        JSONB NOT NULL,
    source_service TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending'
                   CHECK (status IN ('pending', 'published', 'failed')),
    attempts       INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    published_at   TIMESTAMPTZ,
    error          TEXT,
    error_at       TIMESTAMPTZ
)
"#;

const CREATE_POLL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS outbox_events_poll_idx
    ON outbox_events (source_service, status, created_at)
"#;

const SELECT_COLUMNS: &str = "id, event_type, payload, source_service, status, attempts, \
                              created_at, published_at, error, error_at";

/// Outbox store on a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the outbox table and its poll index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;
        sqlx::query(CREATE_POLL_INDEX)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(())
    }

    /// Insert a pending row as part of the caller's transaction.
    ///
    /// Nothing is visible to the worker until the transaction commits.
    #[instrument(
        skip(tx, event),
        fields(event_type = %event.event_type, source_service = %event.source_service),
        err
    )]
    pub async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
    ) -> Result<OutboxEventRow, OutboxStoreError> {
        let row = event.into_row();
        insert_statement(&row)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_in_tx", e))?;
        Ok(row)
    }

    async fn select(
        &self,
        operation: &str,
        source_service: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_events \
             WHERE source_service = $1 AND status = $2 \
             ORDER BY created_at ASC \
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(source_service)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter()
            .map(|row| {
                OutboxEventRow::from_row(row)
                    .map_err(|e| OutboxStoreError::Corrupt(format!("{operation}: {e}")))
            })
            .collect()
    }
}

fn insert_statement(row: &OutboxEventRow) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (
            id,
            event_type,
            payload,
            source_service,
            status,
            attempts,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(row.id.as_uuid())
    .bind(&row.event_type)
    .bind(&row.payload)
    .bind(&row.source_service)
    .bind(row.status.as_str())
    .bind(i32::try_from(row.attempts).unwrap_or(i32::MAX))
    .bind(row.created_at)
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(
        skip(self, event),
        fields(event_type = %event.event_type, source_service = %event.source_service),
        err
    )]
    async fn insert(&self, event: NewOutboxEvent) -> Result<OutboxEventRow, OutboxStoreError> {
        let row = event.into_row();
        insert_statement(&row)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn fetch_pending(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        self.select("fetch_pending", source_service, OutboxStatus::Pending, limit)
            .await
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published', published_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn record_failure(
        &self,
        id: OutboxEventId,
        attempts: u32,
        terminal: bool,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let status = if terminal {
            OutboxStatus::Failed
        } else {
            OutboxStatus::Pending
        };
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = $2, status = $3, error = $4, error_at = $5
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .bind(status.as_str())
        .bind(error)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn list_failed(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        self.select("list_failed", source_service, OutboxStatus::Failed, limit)
            .await
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => OutboxStoreError::Database(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            OutboxStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => OutboxStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => OutboxStoreError::Unavailable(format!("tls error in {operation}: {e}")),
        e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
            OutboxStoreError::Corrupt(format!("{operation}: {e}"))
        }
        other => OutboxStoreError::Database(format!("{operation}: {other}")),
    }
}

impl<'r> FromRow<'r, PgRow> for OutboxEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(OutboxEventRow {
            id: OutboxEventId::from_uuid(row.try_get("id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            source_service: row.try_get("source_service")?,
            status: status
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            attempts: u32::try_from(attempts).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            error: row.try_get("error")?,
            error_at: row.try_get("error_at")?,
        })
    }
}
