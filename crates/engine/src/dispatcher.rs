//! Delivery dispatcher — the per-event state machine.
//!
//! For each event:
//! 1. Load or create its ledger record; a terminal record is returned as is
//! 2. Claim the record (conditional write of a lease + attempt count)
//! 3. Resolve the recipient and check eligibility, skipping when they fail
//! 4. Compose the notification and send it through the transport
//! 5. Record Sent / Pending-for-retry / Failed
//!
//! Every outcome other than a ledger failure is turned into a record state
//! plus a log line. Nothing about one event can stop the next from running.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use courier_common::error::{DirectoryError, LedgerError};
use courier_common::types::{
    DispatchRecord, DispatchState, Event, NotificationRequest, RecipientRecord, SkipReason,
    mask_token,
};
use courier_notifier::{DeliveryError, DeliveryId, PushTransport};

use crate::backoff::Backoff;
use crate::composer;
use crate::config::{ConfigError, DispatchConfig};
use crate::directory::Directory;
use crate::eligibility;
use crate::ledger::DispatchLedger;

/// Result of one `dispatch` call. Always carries the current ledger record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The record is terminal (now, or already before this call).
    Settled(DispatchRecord),
    /// A transient failure; dispatch again once `delay` has passed.
    RetryAfter {
        record: DispatchRecord,
        delay: Duration,
    },
    /// Another attempt holds the claim on this event.
    InFlight(DispatchRecord),
    /// A retry is already scheduled and not yet due.
    Waiting(DispatchRecord),
}

impl DispatchOutcome {
    pub fn record(&self) -> &DispatchRecord {
        match self {
            DispatchOutcome::Settled(record)
            | DispatchOutcome::InFlight(record)
            | DispatchOutcome::Waiting(record)
            | DispatchOutcome::RetryAfter { record, .. } => record,
        }
    }

    pub fn into_record(self) -> DispatchRecord {
        match self {
            DispatchOutcome::Settled(record)
            | DispatchOutcome::InFlight(record)
            | DispatchOutcome::Waiting(record)
            | DispatchOutcome::RetryAfter { record, .. } => record,
        }
    }
}

/// Failures that could not be recorded in the ledger.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("ledger error for event {event_id}: {source}")]
    Ledger {
        event_id: String,
        #[source]
        source: LedgerError,
    },

    /// The claim expired and another attempt took the record over before this
    /// attempt could store its result.
    #[error("claim on event {event_id} was lost before the result ({state}) was stored")]
    ClaimLost {
        event_id: String,
        state: DispatchState,
    },
}

enum Claim {
    Acquired(DispatchRecord),
    Settled(DispatchRecord),
    Busy(DispatchRecord),
    NotDue(DispatchRecord),
}

/// Drives events through lookup, eligibility, composition, and delivery.
pub struct Dispatcher {
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn DispatchLedger>,
    transport: Arc<dyn PushTransport>,
    config: DispatchConfig,
    backoff: Backoff,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn DispatchLedger>,
        transport: Arc<dyn PushTransport>,
        config: DispatchConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let backoff = Backoff::new(config.base_backoff, config.backoff_cap);
        Ok(Self {
            directory,
            ledger,
            transport,
            config,
            backoff,
        })
    }

    pub fn ledger(&self) -> &Arc<dyn DispatchLedger> {
        &self.ledger
    }

    /// Run one dispatch attempt for `event`.
    ///
    /// Safe to call any number of times, concurrently, for the same event:
    /// at most one attempt holds the claim, and a terminal record is never
    /// touched again.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchOutcome, DispatchError> {
        let now = Utc::now();

        let record = match self.claim(event, now).await? {
            Claim::Acquired(record) => record,
            Claim::Settled(record) => {
                tracing::debug!(
                    event_id = %event.event_id,
                    state = %record.state,
                    "Event already settled, skipping"
                );
                return Ok(DispatchOutcome::Settled(record));
            }
            Claim::Busy(record) => {
                tracing::debug!(
                    event_id = %event.event_id,
                    "Event claimed by another attempt"
                );
                return Ok(DispatchOutcome::InFlight(record));
            }
            Claim::NotDue(record) => {
                tracing::debug!(
                    event_id = %event.event_id,
                    next_attempt_at = ?record.next_attempt_at,
                    "Retry already scheduled"
                );
                return Ok(DispatchOutcome::Waiting(record));
            }
        };

        tracing::debug!(
            event_id = %event.event_id,
            recipient_id = %record.recipient_id,
            attempt = record.attempt_count,
            "Dispatch attempt claimed"
        );

        let recipient = match self.resolve(&record.recipient_id).await {
            Ok(Some(recipient)) => recipient,
            Ok(None) => {
                tracing::info!(
                    event_id = %event.event_id,
                    recipient_id = %record.recipient_id,
                    "Recipient not found in directory"
                );
                return self.skip(record, SkipReason::RecipientMissing).await;
            }
            Err(e) => {
                return self
                    .retry_or_fail(record, format!("directory lookup failed: {}", e))
                    .await;
            }
        };

        let token = match eligibility::check(&recipient, &self.config.recipient_role) {
            Ok(token) => token,
            Err(reason) => {
                tracing::info!(
                    event_id = %event.event_id,
                    recipient_id = %record.recipient_id,
                    role = %recipient.role,
                    reason = %reason,
                    "Recipient not eligible"
                );
                return self.skip(record, reason).await;
            }
        };

        let notification = composer::compose(event);

        match self.send(token, &notification).await {
            Ok(delivery_id) => {
                tracing::info!(
                    event_id = %event.event_id,
                    recipient_id = %record.recipient_id,
                    token = %mask_token(token),
                    transport = self.transport.name(),
                    delivery_id = %delivery_id,
                    attempt = record.attempt_count,
                    "Notification sent"
                );
                self.sent(record, delivery_id).await
            }
            Err(DeliveryError::Transient(error)) => self.retry_or_fail(record, error).await,
            Err(DeliveryError::Permanent(error)) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    recipient_id = %record.recipient_id,
                    token = %mask_token(token),
                    error = %error,
                    "Permanent delivery failure, not retrying"
                );
                self.fail(record, error).await
            }
        }
    }

    /// Directory lookup bounded by `lookup_timeout`, so the attempt ends
    /// before its claim does.
    async fn resolve(&self, recipient_id: &str) -> Result<Option<RecipientRecord>, DirectoryError> {
        let timeout = self.config.lookup_timeout;
        match tokio::time::timeout(timeout, self.directory.resolve(recipient_id)).await {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::Unavailable(format!(
                "lookup timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Transport send bounded by `send_timeout`.
    async fn send(
        &self,
        token: &str,
        notification: &NotificationRequest,
    ) -> Result<DeliveryId, DeliveryError> {
        let timeout = self.config.send_timeout;
        match tokio::time::timeout(timeout, self.transport.send(token, notification)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Transient(format!(
                "send timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Load or create the record and take the claim on it.
    async fn claim(&self, event: &Event, now: DateTime<Utc>) -> Result<Claim, DispatchError> {
        let existing = self.ledger_op(&event.event_id, self.ledger.get(&event.event_id).await)?;

        let current = match existing {
            Some(record) if record.is_terminal() => return Ok(Claim::Settled(record)),
            Some(record) if record.is_leased(now) => return Ok(Claim::Busy(record)),
            Some(record) if record.next_attempt_at.is_some_and(|at| at > now) => {
                return Ok(Claim::NotDue(record));
            }
            Some(record) if record.attempt_count >= self.config.max_attempts => {
                // The last claimed attempt never stored a result (crash or lost
                // claim). The budget is spent, so settle instead of claiming again.
                let error = record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "attempt abandoned before completion".to_string());
                return match self.fail(record, error).await {
                    Ok(outcome) => Ok(Claim::Settled(outcome.into_record())),
                    Err(DispatchError::ClaimLost { .. }) => {
                        let fallback = DispatchRecord::new(&event.event_id, event.recipient_id(), now);
                        self.reload(event, fallback).await
                    }
                    Err(e) => Err(e),
                };
            }
            Some(record) => record,
            None => DispatchRecord::new(&event.event_id, event.recipient_id(), now),
        };

        let mut claimed = current.clone();
        claimed.attempt_count += 1;
        claimed.lease_until = Some(after(now, self.config.lease));
        claimed.next_attempt_at = None;
        claimed.updated_at = now;

        match self.ledger.upsert(&claimed).await {
            Ok(stored) => Ok(Claim::Acquired(stored)),
            // Lost the race. Report whatever the winner left behind.
            Err(e) if e.is_conflict() => self.reload(event, current).await,
            Err(e) => Err(DispatchError::Ledger {
                event_id: event.event_id.clone(),
                source: e,
            }),
        }
    }

    /// Re-read a record another attempt just wrote.
    async fn reload(&self, event: &Event, fallback: DispatchRecord) -> Result<Claim, DispatchError> {
        let latest = self
            .ledger_op(&event.event_id, self.ledger.get(&event.event_id).await)?
            .unwrap_or(fallback);
        if latest.is_terminal() {
            Ok(Claim::Settled(latest))
        } else {
            Ok(Claim::Busy(latest))
        }
    }

    async fn skip(
        &self,
        mut record: DispatchRecord,
        reason: SkipReason,
    ) -> Result<DispatchOutcome, DispatchError> {
        record.state = DispatchState::Skipped;
        record.skip_reason = Some(reason);
        record.last_error = None;
        self.settle(record).await
    }

    async fn sent(
        &self,
        mut record: DispatchRecord,
        delivery_id: String,
    ) -> Result<DispatchOutcome, DispatchError> {
        record.state = DispatchState::Sent;
        record.delivery_id = Some(delivery_id);
        record.last_error = None;
        self.settle(record).await
    }

    async fn fail(
        &self,
        mut record: DispatchRecord,
        error: String,
    ) -> Result<DispatchOutcome, DispatchError> {
        record.state = DispatchState::Failed;
        record.last_error = Some(error);
        self.settle(record).await
    }

    /// Transient failure: schedule another attempt, or fail once the budget is spent.
    async fn retry_or_fail(
        &self,
        mut record: DispatchRecord,
        error: String,
    ) -> Result<DispatchOutcome, DispatchError> {
        if record.attempt_count >= self.config.max_attempts {
            tracing::warn!(
                event_id = %record.event_id,
                attempts = record.attempt_count,
                error = %error,
                "Retry budget exhausted"
            );
            let error = format!(
                "gave up after {} attempts: {}",
                record.attempt_count, error
            );
            return self.fail(record, error).await;
        }

        let delay = self.backoff.delay(record.attempt_count);
        let now = Utc::now();
        record.state = DispatchState::Pending;
        record.last_error = Some(error);
        record.lease_until = None;
        record.next_attempt_at = Some(after(now, delay));
        record.updated_at = now;

        let stored = self.store(record).await?;

        tracing::warn!(
            event_id = %stored.event_id,
            attempt = stored.attempt_count,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = stored.last_error.as_deref().unwrap_or_default(),
            "Transient delivery failure, retry scheduled"
        );

        Ok(DispatchOutcome::RetryAfter {
            record: stored,
            delay,
        })
    }

    /// Store a terminal record.
    async fn settle(&self, mut record: DispatchRecord) -> Result<DispatchOutcome, DispatchError> {
        record.lease_until = None;
        record.next_attempt_at = None;
        record.updated_at = Utc::now();

        let stored = self.store(record).await?;

        tracing::info!(
            event_id = %stored.event_id,
            state = %stored.state,
            skip_reason = stored.skip_reason.map(|r| r.as_str()).unwrap_or_default(),
            attempts = stored.attempt_count,
            "Dispatch settled"
        );

        Ok(DispatchOutcome::Settled(stored))
    }

    /// Conditional write under the claim this attempt holds.
    async fn store(&self, record: DispatchRecord) -> Result<DispatchRecord, DispatchError> {
        match self.ledger.upsert(&record).await {
            Ok(stored) => Ok(stored),
            Err(e) if e.is_conflict() => {
                tracing::error!(
                    event_id = %record.event_id,
                    state = %record.state,
                    "Claim lost before result could be stored"
                );
                Err(DispatchError::ClaimLost {
                    event_id: record.event_id,
                    state: record.state,
                })
            }
            Err(e) => Err(DispatchError::Ledger {
                event_id: record.event_id,
                source: e,
            }),
        }
    }

    fn ledger_op<T>(&self, event_id: &str, result: Result<T, LedgerError>) -> Result<T, DispatchError> {
        result.map_err(|source| DispatchError::Ledger {
            event_id: event_id.to_string(),
            source,
        })
    }
}

/// `now + duration`, saturating at the latest representable instant.
fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_common::types::{RecipientStatus, RequestPayload, Role};

    use crate::directory::MemoryDirectory;
    use crate::ledger::MemoryLedger;

    /// Transport that replays a scripted list of results, then repeats the last.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<DeliveryId, DeliveryError>>>,
        calls: AtomicUsize,
        sent: Mutex<Vec<(String, NotificationRequest)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<DeliveryId, DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn send(
            &self,
            token: &str,
            notification: &NotificationRequest,
        ) -> Result<DeliveryId, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent
                .lock()
                .unwrap()
                .push((token.to_string(), notification.clone()));
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct BrokenDirectory;

    #[async_trait]
    impl Directory for BrokenDirectory {
        async fn resolve(&self, _: &str) -> Result<Option<RecipientRecord>, DirectoryError> {
            Err(DirectoryError::Unavailable("connection refused".to_string()))
        }
    }

    fn make_event(event_id: &str) -> Event {
        Event {
            event_id: event_id.to_string(),
            entity_id: "r1".to_string(),
            payload: serde_json::from_value::<RequestPayload>(
                serde_json::json!({ "pickup": "A", "drop": "B" }),
            )
            .unwrap(),
            occurred_at: Utc::now(),
        }
    }

    fn recipient(role: Role, token: Option<&str>) -> RecipientRecord {
        RecipientRecord {
            recipient_id: "r1".to_string(),
            role,
            push_token: token.map(str::to_string),
            status: RecipientStatus::Active,
        }
    }

    fn config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            max_attempts,
            base_backoff: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
            ..DispatchConfig::default()
        }
    }

    fn dispatcher_with(
        directory: Arc<dyn Directory>,
        transport: Arc<ScriptedTransport>,
        max_attempts: u32,
    ) -> (Dispatcher, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let dispatcher =
            Dispatcher::new(directory, ledger.clone(), transport, config(max_attempts)).unwrap();
        (dispatcher, ledger)
    }

    fn driver_directory() -> Arc<MemoryDirectory> {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(recipient(Role::Driver, Some("tok123")));
        directory
    }

    /// Make a pending record due immediately.
    async fn make_due(ledger: &MemoryLedger, event_id: &str) {
        let mut record = ledger.get(event_id).await.unwrap().unwrap();
        record.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(1));
        ledger.upsert(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_sent_on_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let (dispatcher, _) = dispatcher_with(driver_directory(), transport.clone(), 3);

        let outcome = dispatcher.dispatch(&make_event("e1")).await.unwrap();
        let DispatchOutcome::Settled(record) = outcome else {
            panic!("expected settled outcome");
        };
        assert_eq!(record.state, DispatchState::Sent);
        assert_eq!(record.delivery_id.as_deref(), Some("d1"));
        assert_eq!(record.attempt_count, 1);
        assert!(record.lease_until.is_none());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tok123");
        assert_eq!(sent[0].1.body, "Pickup: A → Drop: B");
    }

    #[tokio::test]
    async fn test_second_dispatch_is_noop() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let (dispatcher, _) = dispatcher_with(driver_directory(), transport.clone(), 3);

        let first = dispatcher.dispatch(&make_event("e1")).await.unwrap();
        let second = dispatcher.dispatch(&make_event("e1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_recipient_skipped() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let directory = Arc::new(MemoryDirectory::new());
        let (dispatcher, _) = dispatcher_with(directory, transport.clone(), 3);

        let record = dispatcher.dispatch(&make_event("e1")).await.unwrap().into_record();
        assert_eq!(record.state, DispatchState::Skipped);
        assert_eq!(record.skip_reason, Some(SkipReason::RecipientMissing));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_role_skipped() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(recipient(Role::Customer, Some("tok123")));
        let (dispatcher, _) = dispatcher_with(directory, transport.clone(), 3);

        let record = dispatcher.dispatch(&make_event("e1")).await.unwrap().into_record();
        assert_eq!(record.state, DispatchState::Skipped);
        assert_eq!(record.skip_reason, Some(SkipReason::IneligibleRole));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_token_skipped() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(recipient(Role::Driver, Some("")));
        let (dispatcher, _) = dispatcher_with(directory, transport.clone(), 3);

        let record = dispatcher.dispatch(&make_event("e1")).await.unwrap().into_record();
        assert_eq!(record.skip_reason, Some(SkipReason::NoToken));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let transport = ScriptedTransport::new(vec![
            Err(DeliveryError::Transient("503".to_string())),
            Ok("d2".to_string()),
        ]);
        let (dispatcher, ledger) = dispatcher_with(driver_directory(), transport.clone(), 3);
        let event = make_event("e1");

        let outcome = dispatcher.dispatch(&event).await.unwrap();
        let DispatchOutcome::RetryAfter { record, delay } = outcome else {
            panic!("expected retry outcome");
        };
        assert_eq!(record.state, DispatchState::Pending);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("503"));
        assert_eq!(delay, Duration::from_millis(20));
        assert!(record.next_attempt_at.is_some());

        // Not due yet: a duplicate delivery must not jump the backoff.
        let early = dispatcher.dispatch(&event).await.unwrap();
        assert!(matches!(early, DispatchOutcome::Waiting(_)));
        assert_eq!(transport.calls(), 1);

        make_due(&ledger, "e1").await;
        let record = dispatcher.dispatch(&event).await.unwrap().into_record();
        assert_eq!(record.state, DispatchState::Sent);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.delivery_id.as_deref(), Some("d2"));
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let transport =
            ScriptedTransport::new(vec![Err(DeliveryError::Transient("timeout".to_string()))]);
        let (dispatcher, ledger) = dispatcher_with(driver_directory(), transport.clone(), 3);
        let event = make_event("e1");

        for _ in 0..2 {
            let outcome = dispatcher.dispatch(&event).await.unwrap();
            assert!(matches!(outcome, DispatchOutcome::RetryAfter { .. }));
            make_due(&ledger, "e1").await;
        }

        let outcome = dispatcher.dispatch(&event).await.unwrap();
        let DispatchOutcome::Settled(record) = outcome else {
            panic!("expected settled outcome");
        };
        assert_eq!(record.state, DispatchState::Failed);
        assert_eq!(record.attempt_count, 3);
        assert!(record.last_error.unwrap().contains("timeout"));
        assert_eq!(transport.calls(), 3);

        // Terminal: further dispatches do nothing.
        dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let transport =
            ScriptedTransport::new(vec![Err(DeliveryError::Permanent("UNREGISTERED".to_string()))]);
        let (dispatcher, _) = dispatcher_with(driver_directory(), transport.clone(), 5);

        let record = dispatcher.dispatch(&make_event("e1")).await.unwrap().into_record();
        assert_eq!(record.state, DispatchState::Failed);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("UNREGISTERED"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_directory_outage_is_transient() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let (dispatcher, ledger) = dispatcher_with(Arc::new(BrokenDirectory), transport.clone(), 2);
        let event = make_event("e1");

        let outcome = dispatcher.dispatch(&event).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::RetryAfter { .. }));
        assert!(
            outcome
                .record()
                .last_error
                .as_deref()
                .unwrap()
                .contains("directory lookup failed")
        );

        make_due(&ledger, "e1").await;
        let record = dispatcher.dispatch(&event).await.unwrap().into_record();
        assert_eq!(record.state, DispatchState::Failed);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_leased_record_reports_in_flight() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let (dispatcher, ledger) = dispatcher_with(driver_directory(), transport.clone(), 3);

        let mut held = DispatchRecord::new("e1", "r1", Utc::now());
        held.attempt_count = 1;
        held.lease_until = Some(Utc::now() + chrono::Duration::seconds(60));
        ledger.upsert(&held).await.unwrap();

        let outcome = dispatcher.dispatch(&make_event("e1")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::InFlight(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let (dispatcher, ledger) = dispatcher_with(driver_directory(), transport.clone(), 3);

        let mut abandoned = DispatchRecord::new("e1", "r1", Utc::now());
        abandoned.attempt_count = 1;
        abandoned.lease_until = Some(Utc::now() - chrono::Duration::seconds(1));
        ledger.upsert(&abandoned).await.unwrap();

        let record = dispatcher.dispatch(&make_event("e1")).await.unwrap().into_record();
        assert_eq!(record.state, DispatchState::Sent);
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_abandoned_final_attempt_settles_failed() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let (dispatcher, ledger) = dispatcher_with(driver_directory(), transport.clone(), 2);

        let mut abandoned = DispatchRecord::new("e1", "r1", Utc::now());
        abandoned.attempt_count = 2;
        abandoned.lease_until = Some(Utc::now() - chrono::Duration::seconds(1));
        ledger.upsert(&abandoned).await.unwrap();

        let record = dispatcher.dispatch(&make_event("e1")).await.unwrap().into_record();
        assert_eq!(record.state, DispatchState::Failed);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_send_once() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let (dispatcher, ledger) = dispatcher_with(driver_directory(), transport.clone(), 3);
        let dispatcher = Arc::new(dispatcher);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch(&make_event("e1")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(transport.calls(), 1);
        let records = ledger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, DispatchState::Sent);
        assert_eq!(records[0].attempt_count, 1);
    }

    /// Transport that takes `delay` per send.
    struct SlowTransport {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PushTransport for SlowTransport {
        async fn send(&self, _: &str, _: &NotificationRequest) -> Result<DeliveryId, DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("d{}", call + 1))
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    struct SlowDirectory;

    #[async_trait]
    impl Directory for SlowDirectory {
        async fn resolve(&self, _: &str) -> Result<Option<RecipientRecord>, DirectoryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    #[test]
    fn test_zero_lease_rejected_at_construction() {
        let result = Dispatcher::new(
            driver_directory(),
            Arc::new(MemoryLedger::new()),
            ScriptedTransport::new(vec![Ok("d1".to_string())]),
            DispatchConfig {
                lease: Duration::ZERO,
                ..DispatchConfig::default()
            },
        );
        assert!(matches!(result, Err(ConfigError::ZeroLease)));
    }

    #[test]
    fn test_lease_shorter_than_send_timeout_rejected() {
        let result = Dispatcher::new(
            driver_directory(),
            Arc::new(MemoryLedger::new()),
            ScriptedTransport::new(vec![Ok("d1".to_string())]),
            DispatchConfig {
                lease: Duration::from_secs(5),
                send_timeout: Duration::from_secs(10),
                ..DispatchConfig::default()
            },
        );
        assert!(matches!(result, Err(ConfigError::LeaseTooShort { .. })));
    }

    #[tokio::test]
    async fn test_overlapping_dispatches_during_slow_send_send_once() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(20),
            calls: AtomicUsize::new(0),
        });
        let ledger = Arc::new(MemoryLedger::new());
        let dispatcher = Arc::new(
            Dispatcher::new(
                driver_directory(),
                ledger.clone(),
                transport.clone(),
                DispatchConfig {
                    lease: Duration::from_secs(2),
                    lookup_timeout: Duration::from_millis(500),
                    send_timeout: Duration::from_millis(500),
                    ..config(3)
                },
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch(&make_event("e1")).await
            }));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let record = ledger.get("e1").await.unwrap().unwrap();
        assert_eq!(record.state, DispatchState::Sent);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_is_transient() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_secs(3600),
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(
            driver_directory(),
            Arc::new(MemoryLedger::new()),
            transport,
            config(3),
        )
        .unwrap();

        let outcome = dispatcher.dispatch(&make_event("e1")).await.unwrap();
        let DispatchOutcome::RetryAfter { record, .. } = outcome else {
            panic!("expected retry outcome");
        };
        assert!(record.last_error.unwrap().contains("send timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_is_transient() {
        let transport = ScriptedTransport::new(vec![Ok("d1".to_string())]);
        let dispatcher = Dispatcher::new(
            Arc::new(SlowDirectory),
            Arc::new(MemoryLedger::new()),
            transport.clone(),
            config(3),
        )
        .unwrap();

        let outcome = dispatcher.dispatch(&make_event("e1")).await.unwrap();
        let DispatchOutcome::RetryAfter { record, .. } = outcome else {
            panic!("expected retry outcome");
        };
        assert!(record.last_error.unwrap().contains("lookup timed out"));
        assert_eq!(transport.calls(), 0);
    }
}
