//! Redis-backed storage backend.
//!
//! Every operation that must be atomic across processes (counter bumps,
//! lock release, read-modify-write) runs server-side: either as a single
//! Redis command or as a short Lua script. Nothing in this module performs
//! a check in one round trip and a write in another.

use std::time::Duration;

use redis::{AsyncCommands, Script, aio::ConnectionManager};

use crate::{Mutator, Store, StoreError};

/// Compare-and-delete: release the lock only when the stored token matches.
const RELEASE_LOCK: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0";

/// INCRBY plus first-write expiry for windowed counters.
const ATOMIC_ADD: &str = r"
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 and redis.call('PTTL', KEYS[1]) == -1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return v";

/// Compare-and-set used by the optimistic `update` loop. ARGV[1] is '1'
/// when the caller observed an absent key.
const UPDATE_CAS: &str = r"
local cur = redis.call('GET', KEYS[1])
if (ARGV[1] == '1' and cur == false) or (ARGV[1] == '0' and cur == ARGV[2]) then
  redis.call('SET', KEYS[1], ARGV[3])
  return 1
end
return 0";

/// How many compare-and-set rounds `update` attempts before giving up.
const UPDATE_ATTEMPTS: usize = 64;

/// Network-backed [`Store`] over a Redis server.
///
/// Uses a multiplexed connection manager, so the store is cheap to clone
/// and share across tasks.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn map_err(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let conn = client.get_connection_manager().await.map_err(map_err)?;
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await.map_err(map_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_err)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(map_err)?;
        Ok(())
    }

    async fn update(&self, key: &str, mutator: Mutator<'_>) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let script = Script::new(UPDATE_CAS);
        for _ in 0..UPDATE_ATTEMPTS {
            let current: Option<String> = conn.get(key).await.map_err(map_err)?;
            let Some(next) = mutator(current.as_deref()) else {
                return Ok(current);
            };
            let absent = if current.is_none() { "1" } else { "0" };
            let swapped: i64 = script
                .key(key)
                .arg(absent)
                .arg(current.as_deref().unwrap_or_default())
                .arg(&next)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?;
            if swapped == 1 {
                return Ok(Some(next));
            }
            tracing::trace!(key, "update lost compare-and-set race, retrying");
        }
        Err(StoreError::Backend(format!("update contention on {key}")))
    }

    async fn atomic_add(
        &self,
        key: &str,
        delta: i64,
        window: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let window_ms = window.map_or(0, |w| w.as_millis() as u64);
        Script::new(ATOMIC_ADD)
            .key(key)
            .arg(delta)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(RELEASE_LOCK)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed == 1)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await.map_err(map_err)?;
            let mut keys = Vec::new();
            while let Some(item) = iter.next_item().await {
                keys.push(item);
            }
            keys
        };
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = conn.get(&key).await.map_err(map_err)?;
            if let Some(value) = value {
                out.push((key, value));
            }
        }
        Ok(out)
    }
}
