//! PostgreSQL-backed dispatch ledger (`dispatch_records` table).
//!
//! Inserts use `ON CONFLICT DO NOTHING` and updates are guarded by
//! `WHERE version = $n`, so the conditional-write contract of
//! [`DispatchLedger`] holds across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use courier_common::error::LedgerError;
use courier_common::types::{DispatchRecord, DispatchState, SkipReason};

use crate::ledger::DispatchLedger;

/// Row shape of `dispatch_records`.
#[derive(Debug, sqlx::FromRow)]
struct DispatchRow {
    event_id: String,
    recipient_id: String,
    attempt_count: i32,
    state: String,
    skip_reason: Option<String>,
    delivery_id: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_attempt_at: Option<DateTime<Utc>>,
    lease_until: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<DispatchRow> for DispatchRecord {
    type Error = LedgerError;

    fn try_from(row: DispatchRow) -> Result<Self, Self::Error> {
        let corrupt = |detail: String| LedgerError::Corrupt {
            event_id: row.event_id.clone(),
            detail,
        };

        let state: DispatchState = row.state.parse().map_err(corrupt)?;
        let skip_reason: Option<SkipReason> = row
            .skip_reason
            .as_deref()
            .map(str::parse::<SkipReason>)
            .transpose()
            .map_err(corrupt)?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| corrupt(format!("negative attempt_count {}", row.attempt_count)))?;
        let version = u64::try_from(row.version)
            .map_err(|_| corrupt(format!("negative version {}", row.version)))?;

        Ok(DispatchRecord {
            event_id: row.event_id,
            recipient_id: row.recipient_id,
            attempt_count,
            state,
            skip_reason,
            delivery_id: row.delivery_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_attempt_at: row.next_attempt_at,
            lease_until: row.lease_until,
            version,
        })
    }
}

/// Ledger stored in PostgreSQL.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, record: &DispatchRecord) -> Result<Option<DispatchRow>, LedgerError> {
        let row: Option<DispatchRow> = sqlx::query_as(
            r#"
            INSERT INTO dispatch_records (
                event_id, recipient_id, attempt_count, state, skip_reason, delivery_id,
                last_error, created_at, updated_at, next_attempt_at, lease_until, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.recipient_id)
        .bind(attempt_count_param(record)?)
        .bind(record.state.as_str())
        .bind(record.skip_reason.map(|r| r.as_str()))
        .bind(&record.delivery_id)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.next_attempt_at)
        .bind(record.lease_until)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn update(&self, record: &DispatchRecord) -> Result<Option<DispatchRow>, LedgerError> {
        let expected_version = i64::try_from(record.version).map_err(|_| LedgerError::Corrupt {
            event_id: record.event_id.clone(),
            detail: format!("version {} out of range", record.version),
        })?;

        let row: Option<DispatchRow> = sqlx::query_as(
            r#"
            UPDATE dispatch_records
            SET recipient_id = $2,
                attempt_count = $3,
                state = $4,
                skip_reason = $5,
                delivery_id = $6,
                last_error = $7,
                updated_at = $8,
                next_attempt_at = $9,
                lease_until = $10,
                version = version + 1
            WHERE event_id = $1 AND version = $11
            RETURNING *
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.recipient_id)
        .bind(attempt_count_param(record)?)
        .bind(record.state.as_str())
        .bind(record.skip_reason.map(|r| r.as_str()))
        .bind(&record.delivery_id)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .bind(record.next_attempt_at)
        .bind(record.lease_until)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

fn attempt_count_param(record: &DispatchRecord) -> Result<i32, LedgerError> {
    i32::try_from(record.attempt_count).map_err(|_| LedgerError::Corrupt {
        event_id: record.event_id.clone(),
        detail: format!("attempt_count {} out of range", record.attempt_count),
    })
}

#[async_trait]
impl DispatchLedger for PgLedger {
    async fn get(&self, event_id: &str) -> Result<Option<DispatchRecord>, LedgerError> {
        let row: Option<DispatchRow> =
            sqlx::query_as("SELECT * FROM dispatch_records WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(DispatchRecord::try_from).transpose()
    }

    async fn upsert(&self, record: &DispatchRecord) -> Result<DispatchRecord, LedgerError> {
        let row = if record.version == 0 {
            self.insert(record).await?
        } else {
            self.update(record).await?
        };

        match row {
            Some(row) => DispatchRecord::try_from(row),
            None => Err(LedgerError::Conflict {
                event_id: record.event_id.clone(),
            }),
        }
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchRecord>, LedgerError> {
        let rows: Vec<DispatchRow> = sqlx::query_as(
            r#"
            SELECT *
            FROM dispatch_records
            WHERE state = 'pending'
              AND (lease_until IS NULL OR lease_until <= $1)
              AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DispatchRecord::try_from).collect()
    }
}
