//! Redis-backed [`KvStore`] (requires the `store-redis` feature).
//!
//! Uses a multiplexed tokio connection; compare-and-swap runs as a server-side
//! Lua script so concurrent writers serialize at the store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::info;

use crate::{KvStore, StoreError};

/// CAS script: ARGV = [expect_mode, expected, new, ttl_ms].
/// expect_mode "0" means the key must be absent; "1" means it must equal
/// ARGV[2]. ttl_ms "0" means no expiry.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
local ok
if ARGV[1] == '0' then
  ok = (cur == false)
else
  ok = (cur == ARGV[2])
end
if not ok then
  return 0
end
if ARGV[4] == '0' then
  redis.call('SET', KEYS[1], ARGV[3])
else
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
end
return 1
"#;

/// Shared-store backend over Redis.
pub struct RedisStore {
    conn: MultiplexedConnection,
    cas: Script,
}

impl RedisStore {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Config(format!("invalid redis url: {}", e)))?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        info!(url = %redacted_url(url), "connected to redis store");
        Ok(Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn ttl_millis(ttl: Option<Duration>) -> u64 {
        ttl.map(|t| t.as_millis().max(1) as u64).unwrap_or(0)
    }
}

/// Mask any password in a redis URL for logging.
fn redacted_url(url: &str) -> String {
    match (url.find("://"), url.find('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***@{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(t) = ttl {
            cmd.arg("PX").arg(t.as_millis().max(1) as u64);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let (mode, expected_arg) = match expected {
            Some(v) => ("1", v),
            None => ("0", ""),
        };
        let applied: i64 = self
            .cas
            .key(key)
            .arg(mode)
            .arg(expected_arg)
            .arg(new)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(t) = ttl {
            cmd.arg("PX").arg(t.as_millis().max(1) as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
