//! Redis implementation of the shared store protocol.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, Script};

use super::error::StoreError;
use super::store::{BoundedIncr, Notifications, SharedStore};

const COMPARE_AND_SWAP: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
end
return 0
";

const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    if ARGV[2] ~= '' then
        redis.call('PUBLISH', ARGV[2], ARGV[3])
    end
    return 1
end
return 0
";

const INCR_BELOW: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return {0, current}
end
return {1, redis.call('INCR', KEYS[1])}
";

const DECR_CLAMPED: &str = r"
local value = redis.call('DECR', KEYS[1])
if value < 0 then
    redis.call('SET', KEYS[1], 0)
    return 0
end
return value
";

const PURGE_LIST: &str = r"
local len = redis.call('LLEN', KEYS[1])
redis.call('DEL', KEYS[1])
return len
";

const SCAN_PAGE_SIZE: u32 = 500;

/// Idle blocking-pop connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 16;

/// Shared store backed by a Redis server (6.0 or newer).
///
/// Regular commands share one auto-reconnecting multiplexed connection.
/// Blocking pops and subscriptions use their own connections so they never
/// stall other traffic. Blocking-pop connections are checked out of a small
/// pool shared by clones, one per concurrent pop, and put back after a
/// clean reply; a connection that errored is dropped.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    compare_and_swap: Script,
    compare_and_delete: Script,
    incr_below: Script,
    decr_clamped: Script,
    purge_list: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConfigurationError` for a malformed URL and
    /// `StoreError::ConnectionError` if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::ConfigurationError(format!("invalid Redis URL: {e}")))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;
        tracing::debug!(url = %url, "Connected to Redis");

        Ok(Self {
            client,
            manager,
            blocking: Arc::default(),
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            incr_below: Script::new(INCR_BELOW),
            decr_clamped: Script::new(DECR_CLAMPED),
            purge_list: Script::new(PURGE_LIST),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::ConnectionError(e.to_string())),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    #[cfg(test)]
    fn idle_blocking(&self) -> usize {
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, StoreError> {
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        notify: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        let (channel, message) = notify.unwrap_or(("", ""));
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .arg(channel)
            .arg(message)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(count > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let value: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn incr_below(&self, key: &str, limit: i64) -> Result<BoundedIncr, StoreError> {
        let (incremented, value): (i64, i64) = self
            .incr_below
            .key(key)
            .arg(limit)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(if incremented == 1 {
            BoundedIncr::Incremented(value)
        } else {
            BoundedIncr::AtLimit(value)
        })
    }

    async fn decr_clamped(&self, key: &str) -> Result<i64, StoreError> {
        let value: i64 = self
            .decr_clamped
            .key(key)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across pages.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let len: u64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.checkout_blocking().await?;
        // BLPOP treats 0 as "block forever"; never send that.
        let timeout_secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        self.checkin_blocking(conn);
        Ok(popped.map(|(_list, value)| value))
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let len: u64 = redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn purge_list(&self, key: &str) -> Result<u64, StoreError> {
        let removed: u64 = self
            .purge_list
            .key(key)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<i64>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Notifications, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;
        pubsub.subscribe(channel).await?;
        let messages = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().unwrap_or_default());
        Ok(messages.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        redis::cmd("PING")
            .query_async::<String>(&mut self.conn())
            .await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escapes glob metacharacters so a literal prefix can be used in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg_attr(
        not(feature = "integration"),
        ignore = "requires Redis (enable feature integration)"
    )]
    async fn test_blocking_pops_reuse_connections() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let store = RedisStore::connect(&url).await.unwrap();
        let key = format!("gpulane-test:pool:{}", uuid::Uuid::new_v4());
        let wait = Duration::from_millis(50);

        for _ in 0..3 {
            assert!(store.pop_front_blocking(&key, wait).await.unwrap().is_none());
        }
        assert_eq!(store.idle_blocking(), 1);

        // Concurrent pops each need their own connection; clones share the pool.
        let other = store.clone();
        let (a, b) = tokio::join!(
            store.pop_front_blocking(&key, wait),
            other.pop_front_blocking(&key, wait)
        );
        assert!(a.unwrap().is_none() && b.unwrap().is_none());
        assert_eq!(store.idle_blocking(), 2);
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("task:"), "task:");
        assert_eq!(escape_glob("lane[1]:task:"), "lane\\[1\\]:task:");
        assert_eq!(escape_glob("a*b?"), "a\\*b\\?");
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
    }
}
