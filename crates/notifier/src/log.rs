//! LogTransport - logs notifications via tracing instead of delivering them

use async_trait::async_trait;
use uuid::Uuid;

use courier_common::types::{NotificationRequest, mask_token};

use crate::{DeliveryError, DeliveryId, PushTransport};

/// Dry-run transport. Every send succeeds with a fresh `log-<uuid>` ID.
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for LogTransport {
    async fn send(
        &self,
        token: &str,
        notification: &NotificationRequest,
    ) -> Result<DeliveryId, DeliveryError> {
        let delivery_id = format!("log-{}", Uuid::new_v4());

        tracing::info!(
            event_id = %notification.event_id,
            recipient_id = %notification.recipient_id,
            token = %mask_token(token),
            title = %notification.title,
            body = %notification.body,
            delivery_id = %delivery_id,
            "Notification logged (dry run)"
        );

        Ok(delivery_id)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
