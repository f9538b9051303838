use std::time::Duration;

use thiserror::Error;

use courier_common::config::AppConfig;
use courier_common::types::Role;

/// Settings the dispatcher needs, split out of `AppConfig`.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Claimed attempts per event before it is marked failed. At least 1.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
    /// How long a claim blocks other workers from attempting the same event.
    /// Must outlast `lookup_timeout + send_timeout`.
    pub lease: Duration,
    /// Upper bound on one directory lookup.
    pub lookup_timeout: Duration,
    /// Upper bound on one transport send.
    pub send_timeout: Duration,
    /// Role a recipient must hold to be notified.
    pub recipient_role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("backoff cap {cap:?} is below the base backoff {base:?}")]
    BackoffCapBelowBase { base: Duration, cap: Duration },

    #[error("claim lease must be greater than zero")]
    ZeroLease,

    #[error("claim lease {lease:?} does not outlast one attempt ({attempt:?} of lookup and send timeouts)")]
    LeaseTooShort { lease: Duration, attempt: Duration },
}

impl DispatchConfig {
    /// Longest a claimed attempt can spend in the directory and transport.
    pub fn attempt_budget(&self) -> Duration {
        self.lookup_timeout.saturating_add(self.send_timeout)
    }

    /// Reject settings under which a claim could expire mid-attempt and let a
    /// second attempt send the same notification.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.backoff_cap < self.base_backoff {
            return Err(ConfigError::BackoffCapBelowBase {
                base: self.base_backoff,
                cap: self.backoff_cap,
            });
        }
        if self.lease.is_zero() {
            return Err(ConfigError::ZeroLease);
        }
        let attempt = self.attempt_budget();
        if self.lease <= attempt {
            return Err(ConfigError::LeaseTooShort {
                lease: self.lease,
                attempt,
            });
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            lease: Duration::from_secs(60),
            lookup_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            recipient_role: Role::Driver,
        }
    }
}

impl From<&AppConfig> for DispatchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.dispatch_max_attempts,
            base_backoff: Duration::from_millis(config.dispatch_base_backoff_ms),
            backoff_cap: Duration::from_millis(config.dispatch_backoff_cap_ms),
            lease: Duration::from_secs(config.dispatch_lease_secs),
            lookup_timeout: Duration::from_millis(config.directory_timeout_ms),
            send_timeout: Duration::from_millis(config.fcm_timeout_ms),
            recipient_role: config
                .dispatch_recipient_role
                .parse()
                .unwrap_or_else(|never| match never {}),
        }
    }
}
