use thiserror::Error;

/// Failure reading the recipient directory.
///
/// A missing recipient is not an error; lookups return `Ok(None)` for that.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Failure reading or writing the dispatch ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A conditional write lost against a concurrent writer.
    #[error("Conflicting write for event {event_id}")]
    Conflict { event_id: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt ledger row for event {event_id}: {detail}")]
    Corrupt { event_id: String, detail: String },
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

/// Failure talking to the event queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed queue entry: {0}")]
    Malformed(#[from] serde_json::Error),
}
