//! Redis backend shared by every relay instance.

use super::KeyValueBackend;
use crate::error::BackendError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

/// Stores `ARGV[3]` if the current value matches.
///
/// `ARGV[1]` is "1" when `ARGV[2]` holds the expected value and "0" when
/// the key is expected to be absent. `ARGV[4]` is the TTL in milliseconds,
/// 0 for none.
const CAS_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if ARGV[1] == "1" then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  redis.call("SET", KEYS[1], ARGV[3], "PX", ARGV[4])
else
  redis.call("SET", KEYS[1], ARGV[3])
end
return 1
"#;

/// Increments and sets the TTL only when the counter is created.
const INCR_SCRIPT: &str = r#"
local v = redis.call("INCR", KEYS[1])
if v == 1 and tonumber(ARGV[1]) > 0 then
  redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return v
"#;

/// Redis-backed store.
///
/// Conditional writes run as Lua scripts so the compare and the write are
/// one atomic step on the server.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
    cas_script: Script,
    incr_script: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to Redis at `url`; every key is stored as `<prefix>:<key>`.
    pub async fn connect(url: &str, prefix: String) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix,
            cas_script: Script::new(CAS_SCRIPT),
            incr_script: Script::new(INCR_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    format!("{prefix}:{key}")
}

/// TTL in milliseconds, 0 meaning none. Sub-millisecond TTLs round up.
fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|ttl| (ttl.as_millis() as u64).max(1)).unwrap_or(0)
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(Some(ttl)));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(Some(ttl)));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let (flag, expected) = match expected {
            Some(expected) => ("1", expected),
            None => ("0", &[][..]),
        };
        let swapped: i64 = self
            .cas_script
            .key(self.key(key))
            .arg(flag)
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .incr_script
            .key(self.key(key))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl_millis(Some(ttl)))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        assert_eq!(prefixed("keyexchange", "GET:abcd"), "keyexchange:GET:abcd");
    }

    #[test]
    fn ttl_is_sent_in_milliseconds() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::from_secs(300))), 300_000);
        assert_eq!(ttl_millis(Some(Duration::from_micros(10))), 1);
    }

    #[tokio::test]
    async fn connect_rejects_malformed_url() {
        let err = RedisBackend::connect("not a url", "kx".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Redis(_)));
    }
}
