//! Recipient directory lookup.
//!
//! The directory is owned by another system; this module only reads it.
//! A missing recipient is `Ok(None)`, kept distinct from a lookup failure so
//! the dispatcher can skip the former and retry the latter.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::PgPool;

use courier_common::error::DirectoryError;
use courier_common::types::{RecipientRecord, RecipientStatus};

/// Read-only lookup of delivery contact info by recipient ID.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve(&self, recipient_id: &str) -> Result<Option<RecipientRecord>, DirectoryError>;
}

/// Directory backed by the `users` table.
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn resolve(&self, recipient_id: &str) -> Result<Option<RecipientRecord>, DirectoryError> {
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT id, role, fcm_token, status FROM users WHERE id = $1")
                .bind(recipient_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, role, token, status)| RecipientRecord {
            recipient_id: id,
            role: role.unwrap_or_default().parse().unwrap_or_else(|never| match never {}),
            push_token: token,
            status: status
                .as_deref()
                .map_or(RecipientStatus::Active, RecipientStatus::parse),
        }))
    }
}

/// In-memory directory for tests and local runs.
#[derive(Default)]
pub struct MemoryDirectory {
    records: RwLock<HashMap<String, RecipientRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RecipientRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.recipient_id.clone(), record);
    }

    pub fn remove(&self, recipient_id: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(recipient_id);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn resolve(&self, recipient_id: &str) -> Result<Option<RecipientRecord>, DirectoryError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(recipient_id).cloned())
    }
}
