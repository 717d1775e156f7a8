//! In-process shared store.
//!
//! Mirrors the Redis semantics the lane relies on (expiry, atomic counters,
//! blocking list pops, pub/sub) inside a single process. Expiry uses
//! `tokio::time`, so tests running with a paused clock can advance past a TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use super::error::StoreError;
use super::store::{BoundedIncr, Notifications, SharedStore};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, key: &str) -> Result<Option<&mut Entry>, StoreError> {
        match self.live(key) {
            Some(entry) if matches!(entry.value, Value::List(_)) => Err(wrong_type(key)),
            other => Ok(other),
        }
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn counter(&mut self, key: &str) -> Result<i64, StoreError> {
        match self.string(key)? {
            None => Ok(0),
            Some(Entry {
                value: Value::Str(raw),
                ..
            }) => raw.parse().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
                value: raw.clone(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Writes a counter value, keeping any existing expiry like `INCR` does.
    fn put_counter(&mut self, key: &str, value: i64) {
        let expires_at = self.live(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
    }

    fn sender(&mut self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::CommandError(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

/// A [`SharedStore`] held entirely in memory.
///
/// Clones share state, so handing clones to several components (or several
/// simulated processes) behaves like pointing them at the same Redis.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        let Some(list) = inner.list(key)? else {
            return Ok(None);
        };
        let popped = list.pop_front();
        if list.is_empty() {
            inner.entries.remove(key);
        }
        Ok(popped)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        match inner.string(key)? {
            Some(Entry {
                value: Value::Str(v),
                ..
            }) => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.string(key)? {
            Some(Entry {
                value: Value::Str(current),
                ..
            }) if current.as_str() == expected => {
                *current = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        notify: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let matches = matches!(
            inner.string(key)?,
            Some(Entry { value: Value::Str(current), .. }) if current.as_str() == expected
        );
        if !matches {
            return Ok(false);
        }
        inner.entries.remove(key);
        if let Some((channel, message)) = notify {
            // No subscribers is not an error.
            let _ = inner.sender(channel).send(message.to_string());
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let existed = inner.live(key).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().live(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let next = inner.counter(key)? + 1;
        inner.put_counter(key, next);
        Ok(next)
    }

    async fn incr_below(&self, key: &str, limit: i64) -> Result<BoundedIncr, StoreError> {
        let mut inner = self.lock();
        let current = inner.counter(key)?;
        if current >= limit {
            return Ok(BoundedIncr::AtLimit(current));
        }
        inner.put_counter(key, current + 1);
        Ok(BoundedIncr::Incremented(current + 1))
    }

    async fn decr_clamped(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let next = (inner.counter(key)? - 1).max(0);
        inner.put_counter(key, next);
        Ok(next)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let len = {
            let mut inner = self.lock();
            if let Some(list) = inner.list(key)? {
                list.push_back(value.to_string());
                list.len()
            } else {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(VecDeque::from([value.to_string()])),
                        expires_at: None,
                    },
                );
                1
            }
        };
        self.pushed.notify_waiters();
        Ok(len as u64)
    }

    async fn pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // wait still wakes us.
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        Ok(inner.list(key)?.map_or(0, |list| list.len() as u64))
    }

    async fn purge_list(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let len = inner.list(key)?.map_or(0, |list| list.len() as u64);
        inner.entries.remove(key);
        Ok(len)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let _ = self.lock().sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Notifications, StoreError> {
        let receiver = self.lock().sender(channel).subscribe();
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
