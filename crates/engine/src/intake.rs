//! Event intake — entry point for "record created" events.
//!
//! Events arrive at-least-once and in no particular order. Each one is
//! processed on its own task; the number of concurrently running events is
//! bounded by a semaphore so a burst applies backpressure to the source
//! instead of piling up tasks. Duplicate handling lives in the dispatcher and
//! ledger, not here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use courier_common::types::Event;

use crate::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
use crate::scheduler::RetryScheduler;

/// Feeds events to the dispatcher and hands retryable ones to the scheduler.
pub struct EventIntake {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<dyn RetryScheduler>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl EventIntake {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<dyn RetryScheduler>,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            scheduler,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tasks: TaskTracker::new(),
            cancel,
        }
    }

    /// Accept one event.
    ///
    /// Waits for a free slot, then processes the event on its own task and
    /// returns. Failures are logged on that task and never reach the caller.
    pub async fn on_event(&self, event: Event) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(event_id = %event.event_id, "Intake closed, event dropped");
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let _permit = permit;
            // `process` has already logged the error with its event_id.
            if process(&dispatcher, scheduler.as_ref(), &cancel, event)
                .await
                .is_err()
            {
                tracing::debug!("Event left pending after dispatch error");
            }
        });
    }

    /// Process one event to completion on the calling task.
    pub async fn handle(&self, event: Event) -> Result<DispatchOutcome, DispatchError> {
        process(&self.dispatcher, self.scheduler.as_ref(), &self.cancel, event).await
    }

    /// Consume events from `rx` until it closes or shutdown is requested.
    pub async fn run(&self, mut rx: mpsc::Receiver<Event>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
            }
        }
        tracing::info!(in_flight = self.in_flight(), "Event intake stopped");
    }

    /// Number of events currently being processed.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every in-flight event to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn process(
    dispatcher: &Dispatcher,
    scheduler: &dyn RetryScheduler,
    cancel: &CancellationToken,
    event: Event,
) -> Result<DispatchOutcome, DispatchError> {
    let outcome = match dispatcher.dispatch(&event).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                event_id = %event.event_id,
                error = %e,
                "Dispatch failed"
            );
            return Err(e);
        }
    };

    let retry_in = match &outcome {
        DispatchOutcome::RetryAfter { delay, .. } => Some(*delay),
        // Re-delivered ahead of its backoff; come back when it is due.
        DispatchOutcome::Waiting(record) => Some(remaining(record.next_attempt_at)),
        DispatchOutcome::Settled(_) | DispatchOutcome::InFlight(_) => None,
    };

    if let Some(delay) = retry_in {
        if cancel.is_cancelled() {
            // The record stays pending; a re-delivery or the next start picks it up.
            tracing::info!(
                event_id = %event.event_id,
                "Shutdown requested, retry not scheduled"
            );
        } else if let Err(e) = scheduler.schedule(event.clone(), delay).await {
            tracing::error!(
                event_id = %event.event_id,
                error = %e,
                "Failed to schedule retry"
            );
        }
    }

    Ok(outcome)
}

fn remaining(due: Option<DateTime<Utc>>) -> Duration {
    due.and_then(|at| (at - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}
