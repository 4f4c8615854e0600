//! Redis-backed counter store.
//!
//! Counting runs as a Lua script so the increment, the TTL attached to a new
//! record and the block extension are applied by Redis as one command. A crash
//! or a concurrent reader can never see the counter without its expiry, and a
//! crossed counter never waits on a second round trip for its block.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, trace, warn};

use super::{CounterStore, Expiry, Increment, STORE_TIMEOUT};
use crate::error::{GateError, StoreError};

/// Increments KEYS[1] and attaches the window TTL of ARGV[1] milliseconds
/// when the record was just created. A record found without a TTL is a leak
/// and gets the window TTL as well. The increment that reaches ARGV[2] + 1
/// moves the TTL to the block duration of ARGV[3] milliseconds.
/// Returns `{count, repaired, extended}`.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local repaired = 0
local extended = 0
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
elseif redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    repaired = 1
end
if current == tonumber(ARGV[2]) + 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
    extended = 1
end
return {current, repaired, extended}
"#;

/// Deletes KEYS[1] only while its count is above ARGV[1].
const DELETE_IF_EXCEEDED_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]))
if current and current > tonumber(ARGV[1]) then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Connection settings for the Redis counter store.
#[derive(Clone)]
pub struct RedisSettings {
    /// Redis host name or address
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Optional password
    pub password: Option<String>,
    /// Logical database index
    pub db: i64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl std::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .finish()
    }
}

impl RedisSettings {
    /// Connection parameters for the client. The password is passed as-is,
    /// so it may contain any character.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        }
    }

    /// The `host:port` address, for logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A counter store backed by a shared Redis instance.
///
/// One multiplexed connection is shared by every concurrent caller; each call
/// works on a cheap clone of it, so no caller holds the connection exclusively.
pub struct RedisCounterStore {
    settings: RedisSettings,
    increment: redis::Script,
    delete_if_exceeded: redis::Script,
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("settings", &self.settings)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store for the given settings. No connection is made until
    /// [`CounterStore::connect`] is called.
    pub fn new(settings: RedisSettings) -> Self {
        Self {
            settings,
            increment: redis::Script::new(INCREMENT_SCRIPT),
            delete_if_exceeded: redis::Script::new(DELETE_IF_EXCEEDED_SCRIPT),
            connection: RwLock::new(None),
        }
    }

    /// Get the connection settings.
    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }

    /// Whether a live connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.connection
            .read()
            .as_ref()
            .cloned()
            .ok_or(StoreError::NotConnected)
    }
}

/// Run a store operation under [`STORE_TIMEOUT`].
async fn bounded<T, F>(op: &'static str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(STORE_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            op,
            after: STORE_TIMEOUT,
        }),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn connect(&self) -> Result<(), GateError> {
        let address = self.settings.address();
        info!(
            address = %address,
            db = self.settings.db,
            "Connecting to Redis counter store"
        );

        let client = redis::Client::open(self.settings.connection_info())
            .map_err(|e| GateError::Connection(format!("invalid Redis settings: {}", e)))?;

        let connect = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };

        let conn = tokio::time::timeout(STORE_TIMEOUT, connect)
            .await
            .map_err(|_| {
                GateError::Connection(format!(
                    "Redis at {} did not answer within {:?}",
                    address, STORE_TIMEOUT
                ))
            })?
            .map_err(|e| GateError::Connection(format!("Redis at {}: {}", address, e)))?;

        *self.connection.write() = Some(conn);
        info!(address = %address, "Connected to Redis counter store");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        // Dropping the last clone closes the multiplexed connection.
        if self.connection.write().take().is_some() {
            info!(address = %self.settings.address(), "Disconnected from Redis counter store");
        }
        Ok(())
    }

    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        block: Duration,
    ) -> Result<Increment, StoreError> {
        let mut conn = self.connection()?;
        let window_ms = window.as_millis().max(1) as u64;
        let block_ms = block.as_millis().max(1) as u64;

        let (count, repaired, extended): (i64, i64, i64) = bounded("increment_and_check", async {
            self.increment
                .key(key)
                .arg(window_ms)
                .arg(limit)
                .arg(block_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::from_redis(key, e))
        })
        .await?;

        if repaired == 1 {
            warn!(key = %key, count = count, "Counter had no TTL; attached the window expiry");
        }
        trace!(
            key = %key,
            count = count,
            limit = limit,
            extended = extended == 1,
            "Incremented counter"
        );

        let count = u64::try_from(count).map_err(|_| StoreError::MalformedRecord {
            key: key.to_string(),
            reason: format!("negative counter value {}", count),
        })?;
        Ok(Increment::new(count, limit, extended == 1))
    }

    async fn set_expiry(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;

        let applied: i64 = bounded("set_expiry", async {
            redis::cmd("PEXPIREAT")
                .arg(key)
                .arg(at.timestamp_millis())
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::from_redis(key, e))
        })
        .await?;

        debug!(key = %key, expires_at = %at, applied = applied == 1, "Set counter expiry");
        Ok(applied == 1)
    }

    async fn get_expiry(&self, key: &str) -> Result<Expiry, StoreError> {
        let mut conn = self.connection()?;

        let pttl: i64 = bounded("get_expiry", async {
            redis::cmd("PTTL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::from_redis(key, e))
        })
        .await?;

        trace!(key = %key, pttl_ms = pttl, "Read counter expiry");
        Ok(match pttl {
            -2 => Expiry::Absent,
            -1 => Expiry::Persistent,
            ms if ms >= 0 => Expiry::Remaining(Duration::from_millis(ms as u64)),
            other => {
                return Err(StoreError::Backend(format!(
                    "unexpected PTTL reply {} for key {}",
                    other, key
                )))
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;

        let removed: i64 = bounded("delete", async {
            redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::from_redis(key, e))
        })
        .await?;

        debug!(key = %key, removed = removed, "Deleted counter");
        Ok(removed > 0)
    }

    async fn delete_if_exceeded(&self, key: &str, limit: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;

        let removed: i64 = bounded("delete_if_exceeded", async {
            self.delete_if_exceeded
                .key(key)
                .arg(limit)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::from_redis(key, e))
        })
        .await?;

        debug!(key = %key, limit = limit, removed = removed, "Conditionally deleted counter");
        Ok(removed > 0)
    }
}
