//! Push a record-created event onto the worker queue.
//!
//! ```bash
//! cargo run -p courier-worker --bin enqueue -- <event_id> <entity_id> '{"pickup":"A","drop":"B"}'
//! ```

use chrono::Utc;

use courier_common::types::Event;
use courier_worker::queue::RedisEventQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(event_id), Some(entity_id)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: enqueue <event_id> <entity_id> [payload-json]");
    };
    let payload = match args.next() {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Default::default(),
    };

    dotenvy::dotenv().ok();
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let queue_key =
        std::env::var("INTAKE_QUEUE_KEY").unwrap_or_else(|_| "courier:events".to_string());
    let queue = RedisEventQueue::connect(&redis_url, queue_key).await?;

    let event = Event {
        event_id,
        entity_id,
        payload,
        occurred_at: Utc::now(),
    };
    queue.push(&event).await?;

    tracing::info!(event_id = %event.event_id, queue = %queue.key(), "Event enqueued");
    Ok(())
}
