use redis::aio::ConnectionManager;
use redis::Client;

/// Open a reconnecting Redis connection and verify it answers `PING`.
pub async fn connect(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
