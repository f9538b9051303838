//! Firebase Cloud Messaging transport (HTTP v1 API).
//!
//! Sends one message per call to
//! `POST https://fcm.googleapis.com/v1/projects/{project}/messages:send`
//! and classifies failures as transient or permanent from the HTTP status and
//! the `FcmError` code in the error details.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use courier_common::types::{NotificationRequest, mask_token};

use crate::{DeliveryError, DeliveryId, PushTransport};

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/v1";

/// FCM error codes where the same request can never succeed.
const PERMANENT_ERROR_CODES: &[&str] = &[
    "UNREGISTERED",
    "INVALID_ARGUMENT",
    "SENDER_ID_MISMATCH",
    "THIRD_PARTY_AUTH_ERROR",
];

/// FCM error codes that clear up on their own.
const TRANSIENT_ERROR_CODES: &[&str] = &["QUOTA_EXCEEDED", "UNAVAILABLE", "INTERNAL"];

/// Push transport backed by the FCM HTTP v1 API.
pub struct FcmTransport {
    client: reqwest::Client,
    send_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

impl FcmTransport {
    pub fn new(
        project_id: &str,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            send_url: format!("{}/projects/{}/messages:send", FCM_ENDPOINT, project_id),
            access_token: access_token.into(),
        })
    }

    /// Build the v1 `messages:send` request body.
    pub fn build_message(token: &str, notification: &NotificationRequest) -> serde_json::Value {
        json!({
            "message": {
                "token": token,
                "notification": {
                    "title": notification.title,
                    "body": notification.body,
                },
                "data": notification.data,
            }
        })
    }

    /// Classify a non-success FCM response.
    ///
    /// The `errorCode` in the error details wins when present; otherwise the
    /// HTTP status decides. 401 counts as transient because access tokens
    /// expire and get rotated underneath a running worker.
    pub fn classify_error(status: u16, body: &str) -> DeliveryError {
        let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();

        let error_code = parsed.as_ref().and_then(|e| {
            e.error
                .details
                .iter()
                .find_map(|d| d.error_code.clone())
                .or_else(|| e.error.status.clone())
        });
        let message = match &parsed {
            Some(e) if !e.error.message.is_empty() => {
                format!("HTTP {}: {}", status, e.error.message)
            }
            _ => format!("HTTP {}", status),
        };

        if let Some(code) = error_code.as_deref() {
            if PERMANENT_ERROR_CODES.contains(&code) {
                return DeliveryError::Permanent(format!("{} ({})", message, code));
            }
            if TRANSIENT_ERROR_CODES.contains(&code) {
                return DeliveryError::Transient(format!("{} ({})", message, code));
            }
        }

        match status {
            401 | 408 | 429 | 500..=599 => DeliveryError::Transient(message),
            _ => DeliveryError::Permanent(message),
        }
    }
}

#[async_trait]
impl PushTransport for FcmTransport {
    async fn send(
        &self,
        token: &str,
        notification: &NotificationRequest,
    ) -> Result<DeliveryId, DeliveryError> {
        let body = Self::build_message(token, notification);

        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("FCM request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return match response.json::<SendResponse>().await {
                Ok(sent) => Ok(sent.name),
                Err(e) => {
                    // The provider accepted the message; resending would duplicate it.
                    tracing::warn!(
                        event_id = %notification.event_id,
                        error = %e,
                        "FCM accepted message but response was unreadable"
                    );
                    Ok("unknown".to_string())
                }
            };
        }

        let text = response.text().await.unwrap_or_default();
        let error = Self::classify_error(status.as_u16(), &text);

        tracing::debug!(
            event_id = %notification.event_id,
            token = %mask_token(token),
            status = status.as_u16(),
            error = %error,
            "FCM rejected message"
        );

        Err(error)
    }

    fn name(&self) -> &'static str {
        "fcm"
    }
}
