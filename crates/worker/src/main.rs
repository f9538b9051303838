use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use courier_common::config::{AppConfig, TransportKind};
use courier_common::db;
use courier_engine::directory::PgDirectory;
use courier_engine::ledger::DispatchLedger;
use courier_engine::pg_ledger::PgLedger;
use courier_engine::{DispatchConfig, Dispatcher, EventIntake};
use courier_notifier::{FcmTransport, LogTransport, PushTransport};
use courier_worker::consumer;
use courier_worker::queue::RedisEventQueue;

/// Upper bound on backlog rows inspected at startup.
const BACKLOG_SCAN_LIMIT: usize = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier_worker=info,courier_engine=info,courier_notifier=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::connect(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    // Connect to Redis
    let queue = Arc::new(RedisEventQueue::connect(&config.redis_url, &config.intake_queue_key).await?);

    let transport = build_transport(&config)?;
    tracing::info!(transport = transport.name(), "Push transport ready");

    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(PgDirectory::new(pool)),
        ledger.clone(),
        transport,
        DispatchConfig::from(&config),
    )?);

    let cancel = CancellationToken::new();
    let intake = EventIntake::new(
        dispatcher,
        queue.clone(),
        config.intake_max_concurrency,
        cancel.clone(),
    );

    report_backlog(ledger.as_ref(), &queue).await;
    queue.recover().await?;

    tracing::info!(
        queue = %queue.key(),
        max_concurrency = config.intake_max_concurrency,
        "Consuming events"
    );

    // Ctrl+C only requests shutdown; the consumer stops between entries.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received shutdown signal, stopping gracefully...");
                    cancel.cancel();
                }
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
        });
    }

    let poll_timeout = Duration::from_secs(config.intake_poll_timeout_secs);
    consumer::consume(&queue, &intake, poll_timeout, &cancel).await;

    tracing::info!(in_flight = intake.in_flight(), "Waiting for in-flight events");
    intake.shutdown().await;

    tracing::info!("Courier worker stopped.");
    Ok(())
}

fn build_transport(config: &AppConfig) -> anyhow::Result<Arc<dyn PushTransport>> {
    match config.push_transport {
        TransportKind::Fcm => {
            let project_id = config
                .fcm_project_id
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("FCM_PROJECT_ID is required"))?;
            let access_token = config
                .fcm_access_token
                .clone()
                .ok_or_else(|| anyhow::anyhow!("FCM_ACCESS_TOKEN is required"))?;
            let transport = FcmTransport::new(
                project_id,
                access_token,
                Duration::from_millis(config.fcm_timeout_ms),
            )?;
            Ok(Arc::new(transport))
        }
        TransportKind::Log => Ok(Arc::new(LogTransport::new())),
    }
}

/// Log how much work a previous run left behind.
///
/// Ledger rows are reported only: the event payload is not stored, so the
/// record is picked up again when the source re-delivers the event or its
/// retry is promoted from the delayed set.
async fn report_backlog(ledger: &dyn DispatchLedger, queue: &RedisEventQueue) {
    match ledger.due(Utc::now(), BACKLOG_SCAN_LIMIT).await {
        Ok(records) if !records.is_empty() => {
            tracing::warn!(
                pending = records.len(),
                "Found pending dispatch records from a previous run"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Failed to scan dispatch ledger"),
    }

    match queue.delayed_len().await {
        Ok(delayed) => tracing::info!(delayed, "Scheduled retries waiting"),
        Err(e) => tracing::error!(error = %e, "Failed to read delayed retries"),
    }
}
