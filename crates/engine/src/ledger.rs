//! Dispatch ledger — durable per-event record of delivery attempts.
//!
//! The ledger is what makes dispatch idempotent. Every write is conditional on
//! the record's `version`:
//! - version 0: insert, only if no record exists for the event
//! - version n: update, only if the stored version is still n
//!
//! A losing writer gets `LedgerError::Conflict`. Two workers racing on the same
//! event therefore serialize on the ledger without any global lock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_common::error::LedgerError;
use courier_common::types::{DispatchRecord, DispatchState};

/// Storage for dispatch records, keyed by event ID.
#[async_trait]
pub trait DispatchLedger: Send + Sync {
    async fn get(&self, event_id: &str) -> Result<Option<DispatchRecord>, LedgerError>;

    /// Atomically insert or update `record` (see module docs).
    ///
    /// Returns the stored record with its new version.
    async fn upsert(&self, record: &DispatchRecord) -> Result<DispatchRecord, LedgerError>;

    /// Pending records whose retry is due and which no live attempt holds.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchRecord>, LedgerError>;
}

/// Whether a pending record may be picked up at `now`.
pub(crate) fn is_due(record: &DispatchRecord, now: DateTime<Utc>) -> bool {
    record.state == DispatchState::Pending
        && !record.is_leased(now)
        && record.next_attempt_at.is_none_or(|at| at <= now)
}

/// Mutex-guarded in-process ledger.
///
/// Same conditional-write semantics as the Postgres ledger. The lock is held
/// only for the map operation, never across an await.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, DispatchRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record.
    pub fn records(&self) -> Vec<DispatchRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.values().cloned().collect()
    }
}

#[async_trait]
impl DispatchLedger for MemoryLedger {
    async fn get(&self, event_id: &str) -> Result<Option<DispatchRecord>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(event_id).cloned())
    }

    async fn upsert(&self, record: &DispatchRecord) -> Result<DispatchRecord, LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

        let stored_version = records.get(&record.event_id).map(|r| r.version);
        let matches = match stored_version {
            None => record.version == 0,
            Some(v) => record.version != 0 && v == record.version,
        };
        if !matches {
            return Err(LedgerError::Conflict {
                event_id: record.event_id.clone(),
            });
        }

        let mut stored = record.clone();
        stored.version = record.version + 1;
        records.insert(stored.event_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchRecord>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<DispatchRecord> = records
            .values()
            .filter(|r| is_due(r, now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.updated_at);
        due.truncate(limit);
        Ok(due)
    }
}
