use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A "record created" event as delivered by the event source.
///
/// Events are immutable facts. The same event may be delivered more than once;
/// `event_id` is the idempotency key for everything downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// Identifier of the record whose creation raised this event.
    pub entity_id: String,
    #[serde(default)]
    pub payload: RequestPayload,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// The user this event should be delivered to.
    ///
    /// Uses the payload's `to` field when it holds a non-empty string,
    /// otherwise falls back to `entity_id`.
    pub fn recipient_id(&self) -> &str {
        match self.payload.to.as_ref().and_then(|v| v.as_str()) {
            Some(to) if !to.trim().is_empty() => to,
            _ => &self.entity_id,
        }
    }
}

/// Payload of a transport request record.
///
/// The known fields are optional: a missing field is a normal case handled by
/// the composer, not a decode error. Everything else lands in `extra` and is
/// forwarded to the client as routing data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Recipient user ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<serde_json::Value>,
    /// Pickup location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup: Option<serde_json::Value>,
    /// Drop-off location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Role of a user in the directory.
///
/// Parsing is exact and case-sensitive: only `"Driver"` is `Role::Driver`,
/// while `"driver"` is `Role::Other("driver")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Driver,
    Customer,
    Admin,
    Other(String),
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let role = match s {
            "Driver" => Role::Driver,
            "Customer" => Role::Customer,
            "Admin" => Role::Admin,
            other => Role::Other(other.to_string()),
        };
        Ok(role)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Driver => write!(f, "Driver"),
            Role::Customer => write!(f, "Customer"),
            Role::Admin => write!(f, "Admin"),
            Role::Other(role) => write!(f, "{}", role),
        }
    }
}

/// Account status of a directory user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Active,
    Inactive,
}

impl RecipientStatus {
    /// Anything other than `active` is reported as inactive.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("active") {
            RecipientStatus::Active
        } else {
            RecipientStatus::Inactive
        }
    }
}

/// Delivery-relevant view of a directory user. Read-only to this system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRecord {
    pub recipient_id: String,
    pub role: Role,
    pub push_token: Option<String>,
    pub status: RecipientStatus,
}

/// Mask a push token for logging, keeping only the last 4 characters.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

/// Transport-ready notification. Built fresh for every attempt, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub event_id: String,
    pub recipient_id: String,
    pub title: String,
    pub body: String,
    /// Client-side routing data. Push providers require string values.
    pub data: BTreeMap<String, String>,
}

/// Lifecycle state of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    Pending,
    Sent,
    Failed,
    Skipped,
}

impl DispatchState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DispatchState::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchState::Pending => "pending",
            DispatchState::Sent => "sent",
            DispatchState::Failed => "failed",
            DispatchState::Skipped => "skipped",
        }
    }
}

impl FromStr for DispatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DispatchState::Pending),
            "sent" => Ok(DispatchState::Sent),
            "failed" => Ok(DispatchState::Failed),
            "skipped" => Ok(DispatchState::Skipped),
            other => Err(format!("unknown dispatch state '{}'", other)),
        }
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a dispatch was skipped without contacting the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The directory has no record for the recipient.
    RecipientMissing,
    /// The recipient exists but does not hold the expected role.
    IneligibleRole,
    /// The recipient has the right role but no usable push token.
    NoToken,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::RecipientMissing => "recipient_missing",
            SkipReason::IneligibleRole => "ineligible_role",
            SkipReason::NoToken => "no_token",
        }
    }
}

impl FromStr for SkipReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recipient_missing" => Ok(SkipReason::RecipientMissing),
            "ineligible_role" => Ok(SkipReason::IneligibleRole),
            "no_token" => Ok(SkipReason::NoToken),
            other => Err(format!("unknown skip reason '{}'", other)),
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry for one event. Keyed by `event_id`, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub event_id: String,
    pub recipient_id: String,
    /// Number of claimed dispatch attempts so far.
    pub attempt_count: u32,
    pub state: DispatchState,
    pub skip_reason: Option<SkipReason>,
    /// Provider message ID, set once the notification is sent.
    pub delivery_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a pending record's next retry is due.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set while an attempt holds the claim on this record.
    pub lease_until: Option<DateTime<Utc>>,
    /// Optimistic concurrency version. `0` means not yet stored.
    pub version: u64,
}

impl DispatchRecord {
    /// A fresh, unstored pending record.
    pub fn new(event_id: impl Into<String>, recipient_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.into(),
            recipient_id: recipient_id.into(),
            attempt_count: 0,
            state: DispatchState::Pending,
            skip_reason: None,
            delivery_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            lease_until: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another attempt currently holds an unexpired claim.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.is_some_and(|until| until > now)
    }
}
