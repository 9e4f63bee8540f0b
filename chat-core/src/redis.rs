use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::sync::Arc;
use tracing;

use crate::types::PresenceRecord;

pub type RedisPool = Arc<Client>;
pub type RedisConnection = MultiplexedConnection;

pub async fn create_pool(url: &str) -> Result<RedisPool> {
    tracing::info!("Setting up Redis connection");
    tracing::info!("Redis URL: {}", mask_redis_url(url));

    let client = Client::open(url)
        .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;

    let _pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| anyhow!("Failed to ping Redis: {}", e))?;

    tracing::info!("Redis connection established successfully!");

    Ok(Arc::new(client))
}

pub async fn get_connection(pool: &RedisPool) -> Result<RedisConnection> {
    pool.get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))
}

pub fn presence_key(user_id: &str) -> String {
    format!("PRESENCE:{}", user_id)
}

/// Last-writer-wins mirror of a presence record, readable by other instances.
pub async fn write_presence(conn: &mut RedisConnection, record: &PresenceRecord) -> Result<()> {
    let state = serde_json::to_value(record.state)?;
    let _: i64 = redis::cmd("HSET")
        .arg(presence_key(record.user_id.as_str()))
        .arg("state")
        .arg(state.as_str().unwrap_or("offline"))
        .arg("last_changed")
        .arg(record.last_changed.to_rfc3339())
        .query_async(conn)
        .await
        .map_err(|e| anyhow!("Failed to write presence: {}", e))?;
    Ok(())
}

fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let (before_at, after_at) = url.split_at(at_pos);
        if let Some(colon_pos) = before_at.rfind(':') {
            let (protocol_user, _password) = before_at.split_at(colon_pos);
            format!("{}:****{}", protocol_user, after_at)
        } else {
            format!("redis://****{}", after_at)
        }
    } else {
        url.to_string()
    }
}
