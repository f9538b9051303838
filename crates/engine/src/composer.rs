//! Notification composer.
//!
//! Turns a transport-request event into a push notification. Pure: no I/O,
//! and it never fails. A missing field renders a placeholder; a field of the
//! wrong shape is logged as a composer defect and renders a different
//! placeholder.

use std::collections::BTreeMap;

use thiserror::Error;

use courier_common::types::{Event, NotificationRequest};

/// Notification title for new transport requests.
pub const TITLE: &str = "🚚 New Transport Request";

/// Rendered in place of a field the payload does not carry.
pub const MISSING_PLACEHOLDER: &str = "(not specified)";

/// Rendered in place of a field that cannot be shown as text.
pub const INVALID_PLACEHOLDER: &str = "(invalid)";

/// Data keys the push provider reserves for itself.
const RESERVED_DATA_KEYS: &[&str] = &["from", "notification", "message_type"];
const RESERVED_DATA_PREFIXES: &[&str] = &["google", "gcm"];

/// A payload field that could not be rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payload field '{field}' holds {kind}, expected text")]
pub struct ComposerDefect {
    pub field: &'static str,
    pub kind: &'static str,
}

/// Build the notification for `event`.
pub fn compose(event: &Event) -> NotificationRequest {
    let pickup = display_field(event, "pickup", event.payload.pickup.as_ref());
    let drop = display_field(event, "drop", event.payload.drop.as_ref());

    NotificationRequest {
        event_id: event.event_id.clone(),
        recipient_id: event.recipient_id().to_string(),
        title: TITLE.to_string(),
        body: format!("Pickup: {} → Drop: {}", pickup, drop),
        data: routing_data(event),
    }
}

/// Render a named text field, falling back to a placeholder.
fn display_field(event: &Event, field: &'static str, value: Option<&serde_json::Value>) -> String {
    match text_field(field, value) {
        Ok(Some(text)) => text,
        Ok(None) => MISSING_PLACEHOLDER.to_string(),
        Err(defect) => {
            tracing::warn!(
                event_id = %event.event_id,
                field = defect.field,
                kind = defect.kind,
                "Composer defect: payload field rendered as placeholder"
            );
            INVALID_PLACEHOLDER.to_string()
        }
    }
}

/// Read a payload field as display text.
///
/// Absent, `null`, and blank strings count as missing. Numbers are accepted
/// (a numeric stop ID is still meaningful text).
pub fn text_field(
    field: &'static str,
    value: Option<&serde_json::Value>,
) -> Result<Option<String>, ComposerDefect> {
    use serde_json::Value;

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(_)) => Err(ComposerDefect { field, kind: "a boolean" }),
        Some(Value::Array(_)) => Err(ComposerDefect { field, kind: "an array" }),
        Some(Value::Object(_)) => Err(ComposerDefect { field, kind: "an object" }),
    }
}

/// Machine-readable data for client-side routing.
///
/// Every payload field is carried over as a string (push data must be a
/// string map; nested values become JSON text). The identifying keys are
/// written last so the payload cannot overwrite them.
fn routing_data(event: &Event) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();

    let known = [
        ("to", event.payload.to.as_ref()),
        ("pickup", event.payload.pickup.as_ref()),
        ("drop", event.payload.drop.as_ref()),
    ];
    let fields = known
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .chain(event.payload.extra.iter().map(|(k, v)| (k.as_str(), v)));

    for (key, value) in fields {
        if is_reserved_key(key) {
            tracing::debug!(
                event_id = %event.event_id,
                key,
                "Dropping reserved key from notification data"
            );
            continue;
        }
        let text = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        data.insert(key.to_string(), text);
    }

    data.insert("type".to_string(), "transport_request".to_string());
    data.insert("event_id".to_string(), event.event_id.clone());
    data.insert("entity_id".to_string(), event.entity_id.clone());
    data.insert("recipient_id".to_string(), event.recipient_id().to_string());
    data.insert("occurred_at".to_string(), event.occurred_at.to_rfc3339());

    data
}

fn is_reserved_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    RESERVED_DATA_KEYS.contains(&lower.as_str())
        || RESERVED_DATA_PREFIXES.iter().any(|p| lower.starts_with(p))
}
