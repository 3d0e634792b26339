use crate::config::StoreConfig;
use crate::store::StoreResult;
use redis::{aio::ConnectionManager, Client};

/// Create a Redis client and connection manager
pub async fn create_client(config: &StoreConfig) -> StoreResult<ConnectionManager> {
    tracing::info!("Creating Redis client");

    let client = Client::open(config.redis_url.as_str())?;

    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Redis client connected");

    Ok(manager)
}

/// Health check for Redis connection
pub async fn health_check(manager: &mut ConnectionManager) -> StoreResult<()> {
    let _: String = redis::cmd("PING").query_async(manager).await?;
    Ok(())
}
