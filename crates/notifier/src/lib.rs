pub mod fcm;
pub mod log;

use async_trait::async_trait;
use thiserror::Error;

use courier_common::types::NotificationRequest;

pub use fcm::FcmTransport;
pub use log::LogTransport;

/// Provider-assigned identifier of a delivered message.
pub type DeliveryId = String;

/// Outcome of a failed send, classified by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Timeout, rate limit, provider outage. Worth retrying.
    #[error("transient delivery error: {0}")]
    Transient(String),

    /// Invalid or unregistered token, malformed message. Retrying cannot succeed.
    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

#[cfg(test)]
impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// A push delivery capability.
///
/// Built once at process start and injected into the dispatcher, so tests can
/// substitute a stub.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Deliver `notification` to the device identified by `token`.
    async fn send(
        &self,
        token: &str,
        notification: &NotificationRequest,
    ) -> Result<DeliveryId, DeliveryError>;

    /// Human-readable name for this transport (e.g., "fcm").
    fn name(&self) -> &'static str;
}
