//! Queue consumer loop.
//!
//! Cancellation is only observed at the top of an iteration. A pop in
//! progress runs to completion (at most one poll timeout) and its entry is
//! handed to the intake before the loop checks again, so shutting down never
//! drops an event that has left the queue.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use courier_engine::EventIntake;

use crate::queue::RedisEventQueue;

/// Retries moved from the delayed set per loop iteration.
const PROMOTE_BATCH: usize = 100;

/// Feed `intake` from `queue` until `cancel` fires.
pub async fn consume(
    queue: &RedisEventQueue,
    intake: &EventIntake,
    poll_timeout: Duration,
    cancel: &CancellationToken,
) {
    while !cancel.is_cancelled() {
        if let Err(e) = queue.promote_due(Utc::now(), PROMOTE_BATCH).await {
            tracing::error!(error = %e, "Failed to promote due retries");
        }

        let entry = match queue.pop(poll_timeout).await {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(e) => {
                // ConnectionManager reconnects on the next command
                tracing::error!(error = %e, "Queue read failed, retrying...");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match entry.decode() {
            Ok(event) => intake.on_event(event).await,
            Err(e) => tracing::warn!(error = %e, "Dropping malformed queue entry"),
        }

        if let Err(e) = queue.ack(&entry).await {
            // Left in the processing list; the next start re-queues it and the
            // ledger absorbs the duplicate.
            tracing::error!(error = %e, "Failed to acknowledge queue entry");
        }
    }

    tracing::info!(queue = %queue.key(), "Queue consumer stopped");
}
