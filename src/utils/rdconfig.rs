// src/utils/rdconfig.rs
use redis::{aio::MultiplexedConnection, Client};
use tracing::info;

/// Open one multiplexed connection; clones of it share the same socket.
pub async fn get_redis_connection(redis_url: &str) -> redis::RedisResult<MultiplexedConnection> {
    let client = Client::open(redis_url)?;
    let conn = client.get_multiplexed_async_connection().await?;
    info!(target: "queue", "connected to redis");
    Ok(conn)
}
