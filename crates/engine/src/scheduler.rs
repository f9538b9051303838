//! Retry scheduling.
//!
//! A retryable dispatch is never retried in place. The event is handed to a
//! scheduler, which re-delivers it to the intake once its backoff has passed,
//! on whichever worker picks it up.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use courier_common::error::QueueError;
use courier_common::types::Event;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduler is shut down")]
    Closed,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Re-delivers an event after a delay.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    async fn schedule(&self, event: Event, delay: Duration) -> Result<(), ScheduleError>;
}

/// In-process scheduler: sleeps on a tokio task, then re-submits the event
/// to the intake channel.
///
/// Scheduled retries do not survive a restart.
pub struct TokioScheduler {
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::Sender<Event>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    /// Number of retries currently waiting.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every waiting retry to fire or be abandoned.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[async_trait]
impl RetryScheduler for TokioScheduler {
    async fn schedule(&self, event: Event, delay: Duration) -> Result<(), ScheduleError> {
        if self.cancel.is_cancelled() || self.tx.is_closed() {
            return Err(ScheduleError::Closed);
        }

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    tracing::info!(
                        event_id = %event.event_id,
                        "Shutdown requested, scheduled retry abandoned"
                    );
                    return;
                }
            }

            let event_id = event.event_id.clone();
            if tx.send(event).await.is_err() {
                tracing::warn!(
                    event_id = %event_id,
                    "Intake closed, scheduled retry dropped"
                );
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_common::types::RequestPayload;

    fn make_event(event_id: &str) -> Event {
        Event {
            event_id: event_id.to_string(),
            entity_id: "r1".to_string(),
            payload: RequestPayload::default(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_redelivered_after_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TokioScheduler::new(tx, CancellationToken::new());

        scheduler
            .schedule(make_event("e1"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(scheduler.pending(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_id, "e1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_waiting_retry() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let scheduler = TokioScheduler::new(tx, cancel.clone());

        scheduler
            .schedule(make_event("e1"), Duration::from_secs(30))
            .await
            .unwrap();
        cancel.cancel();
        scheduler.wait().await;

        assert!(rx.try_recv().is_err());
        assert!(matches!(
            scheduler.schedule(make_event("e2"), Duration::ZERO).await,
            Err(ScheduleError::Closed)
        ));
    }
}
