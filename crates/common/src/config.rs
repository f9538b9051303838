use serde::Deserialize;

/// Which push transport the worker delivers through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Firebase Cloud Messaging HTTP v1 API.
    Fcm,
    /// Dry run: log the notification and report success.
    Log,
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fcm" => Ok(TransportKind::Fcm),
            "log" => Ok(TransportKind::Log),
            other => Err(anyhow::anyhow!(
                "PUSH_TRANSPORT must be 'fcm' or 'log', got '{}'",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Delivery attempts per event before it is marked failed (default: 5)
    pub dispatch_max_attempts: u32,

    /// Base retry delay in milliseconds (default: 1000)
    pub dispatch_base_backoff_ms: u64,

    /// Upper bound on the retry delay in milliseconds (default: 300000)
    pub dispatch_backoff_cap_ms: u64,

    /// How long a claimed attempt may run before another worker may take over (default: 60)
    pub dispatch_lease_secs: u64,

    /// Directory role a recipient must hold to be notified (default: "Driver")
    pub dispatch_recipient_role: String,

    /// Maximum events processed concurrently (default: 32)
    pub intake_max_concurrency: usize,

    /// Upper bound on one directory lookup in milliseconds (default: 5000)
    pub directory_timeout_ms: u64,

    /// Redis list the event source pushes onto (default: "courier:events")
    pub intake_queue_key: String,

    /// Blocking pop timeout in seconds (default: 5)
    pub intake_poll_timeout_secs: u64,

    /// Push transport to deliver through (default: fcm)
    pub push_transport: TransportKind,

    /// Firebase project ID
    pub fcm_project_id: Option<String>,

    /// OAuth2 access token for the FCM HTTP v1 API
    pub fcm_access_token: Option<String>,

    /// FCM request timeout in milliseconds (default: 10000)
    pub fcm_timeout_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            dispatch_max_attempts: std::env::var("DISPATCH_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DISPATCH_MAX_ATTEMPTS must be a valid u32"))?,
            dispatch_base_backoff_ms: std::env::var("DISPATCH_BASE_BACKOFF_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DISPATCH_BASE_BACKOFF_MS must be a valid u64"))?,
            dispatch_backoff_cap_ms: std::env::var("DISPATCH_BACKOFF_CAP_MS")
                .unwrap_or_else(|_| "300000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DISPATCH_BACKOFF_CAP_MS must be a valid u64"))?,
            dispatch_lease_secs: std::env::var("DISPATCH_LEASE_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DISPATCH_LEASE_SECS must be a valid u64"))?,
            dispatch_recipient_role: std::env::var("DISPATCH_RECIPIENT_ROLE")
                .unwrap_or_else(|_| "Driver".to_string()),
            intake_max_concurrency: std::env::var("INTAKE_MAX_CONCURRENCY")
                .unwrap_or_else(|_| "32".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("INTAKE_MAX_CONCURRENCY must be a valid usize"))?,
            directory_timeout_ms: std::env::var("DIRECTORY_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DIRECTORY_TIMEOUT_MS must be a valid u64"))?,
            intake_queue_key: std::env::var("INTAKE_QUEUE_KEY")
                .unwrap_or_else(|_| "courier:events".to_string()),
            intake_poll_timeout_secs: std::env::var("INTAKE_POLL_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("INTAKE_POLL_TIMEOUT_SECS must be a valid u64"))?,
            push_transport: std::env::var("PUSH_TRANSPORT")
                .unwrap_or_else(|_| "fcm".to_string())
                .parse()?,
            fcm_project_id: std::env::var("FCM_PROJECT_ID").ok(),
            fcm_access_token: std::env::var("FCM_ACCESS_TOKEN").ok(),
            fcm_timeout_ms: std::env::var("FCM_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("FCM_TIMEOUT_MS must be a valid u64"))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_max_attempts == 0 {
            anyhow::bail!("DISPATCH_MAX_ATTEMPTS must be at least 1");
        }
        if self.intake_max_concurrency == 0 {
            anyhow::bail!("INTAKE_MAX_CONCURRENCY must be at least 1");
        }
        if self.dispatch_backoff_cap_ms < self.dispatch_base_backoff_ms {
            anyhow::bail!("DISPATCH_BACKOFF_CAP_MS must not be below DISPATCH_BASE_BACKOFF_MS");
        }
        if self.dispatch_lease_secs == 0 {
            anyhow::bail!("DISPATCH_LEASE_SECS must be at least 1");
        }
        let attempt_ms = self.directory_timeout_ms.saturating_add(self.fcm_timeout_ms);
        if self.dispatch_lease_secs.saturating_mul(1000) <= attempt_ms {
            anyhow::bail!(
                "DISPATCH_LEASE_SECS ({}s) must exceed DIRECTORY_TIMEOUT_MS + FCM_TIMEOUT_MS ({}ms)",
                self.dispatch_lease_secs,
                attempt_ms
            );
        }
        if self.push_transport == TransportKind::Fcm
            && (self.fcm_project_id.is_none() || self.fcm_access_token.is_none())
        {
            anyhow::bail!(
                "FCM_PROJECT_ID and FCM_ACCESS_TOKEN are required when PUSH_TRANSPORT=fcm"
            );
        }
        Ok(())
    }
}
