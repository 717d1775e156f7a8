//! Cross-process exclusive lock over the shared store.
//!
//! Acquisition is a set-if-absent with expiry on one well-known key, holding
//! a random token. Release deletes the key only while it still holds the
//! caller's token and announces the release on a channel, which wakes
//! waiters ahead of their backoff timer. A holder that dies without releasing
//! loses the lock when the key expires.

mod backoff;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::storage::{KeySpace, Notifications, SharedStore, StoreError};

pub use backoff::Backoff;

/// Message published on the release channel.
pub const RELEASED_MESSAGE: &str = "released";

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The store failed while acquiring or releasing.
    #[error("lock store error: {0}")]
    Store(#[from] StoreError),

    /// The configured maximum wait elapsed before the lock was obtained.
    #[error("timed out after {waited:?} waiting for the exclusive lock")]
    WaitTimeout {
        /// How long the caller waited.
        waited: Duration,
    },
}

/// Tuning for [`GpuLock`].
#[derive(Debug, Clone, PartialEq)]
pub struct LockSettings {
    /// Server-side expiry of the lock key. Must exceed the longest protected operation.
    pub ttl: Duration,
    /// Retry schedule while the lock is held elsewhere.
    pub backoff: Backoff,
    /// Subscribe to release notifications while waiting.
    pub notify: bool,
    /// Give up after this long. `None` waits forever.
    pub max_wait: Option<Duration>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1800),
            backoff: Backoff::default(),
            notify: true,
            max_wait: None,
        }
    }
}

/// Result of [`LockGuard::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The key held our token and was deleted.
    Released,
    /// The key had expired or belonged to another holder; nothing was deleted.
    NotOwner,
}

/// The distributed exclusive lock. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GpuLock {
    store: Arc<dyn SharedStore>,
    key: String,
    channel: String,
    settings: LockSettings,
}

impl GpuLock {
    /// Creates a lock handle on the key space's lock key.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, keys: &KeySpace, settings: LockSettings) -> Self {
        Self {
            store,
            key: keys.gpu_lock(),
            channel: keys.gpu_lock_channel(),
            settings,
        }
    }

    /// Waits until the lock is obtained.
    ///
    /// Retries with jittered exponential backoff; a release notification
    /// triggers an immediate retry.
    ///
    /// # Errors
    ///
    /// Returns `LockError::WaitTimeout` if a maximum wait is configured and
    /// elapses, or `LockError::Store` if an acquisition attempt fails.
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let token = Uuid::new_v4().to_string();
        let backoff = self.settings.backoff;

        // Subscribe before the first attempt so a release between a failed
        // attempt and the wait is not missed.
        let mut wakeups = if self.settings.notify {
            self.subscribe().await
        } else {
            None
        };
        let mut interval = backoff.initial_interval();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self
                .store
                .set_if_absent(&self.key, &token, self.settings.ttl)
                .await?
            {
                let waited = started.elapsed();
                counter!("gpulane.lock.acquired").increment(1);
                histogram!("gpulane.lock.wait_seconds").record(waited.as_secs_f64());
                tracing::debug!(attempts, waited = ?waited, "Acquired exclusive lock");
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    key: self.key.clone(),
                    channel: self.channel.clone(),
                    token,
                    acquired_at: Instant::now(),
                });
            }

            let mut delay = backoff.apply_jitter(interval);
            if let Some(max_wait) = self.settings.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    tracing::warn!(attempts, waited = ?waited, "Gave up waiting for exclusive lock");
                    return Err(LockError::WaitTimeout { waited });
                }
                delay = delay.min(max_wait - waited);
            }

            let channel_closed = if let Some(stream) = wakeups.as_mut() {
                tokio::select! {
                    message = stream.next() => message.is_none(),
                    () = tokio::time::sleep(delay) => false,
                }
            } else {
                tokio::time::sleep(delay).await;
                false
            };
            if channel_closed {
                tracing::debug!("Release notifications ended; continuing with backoff only");
                wakeups = None;
            }
            interval = backoff.next_interval(interval);
        }
    }

    async fn subscribe(&self) -> Option<Notifications> {
        match self.store.subscribe(&self.channel).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(error = %e, "Release notifications unavailable; using backoff only");
                None
            }
        }
    }

    /// Returns true if any process currently holds the lock.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Store` if the store cannot be read.
    pub async fn is_held(&self) -> Result<bool, LockError> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// Deletes the lock key regardless of owner.
    ///
    /// Only safe when no live process can be holding it, i.e. during restart
    /// recovery. Returns true if a key was removed.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Store` if the delete fails.
    pub async fn force_clear(&self) -> Result<bool, LockError> {
        let removed = self.store.delete(&self.key).await?;
        if removed {
            // Wake anyone still waiting in this process.
            if let Err(e) = self.store.publish(&self.channel, RELEASED_MESSAGE).await {
                tracing::debug!(error = %e, "Failed to announce forced release");
            }
        }
        Ok(removed)
    }

    /// The configured lock key expiry.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.settings.ttl
    }
}

/// Proof of holding the lock. Call [`LockGuard::release`] when done.
///
/// Dropping a guard without releasing leaves the key in place until it expires.
#[derive(Debug)]
#[must_use = "the lock stays held until released or expired"]
pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    channel: String,
    token: String,
    acquired_at: Instant,
}

impl LockGuard {
    /// The random token stored in the lock key.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// How long the lock has been held.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Releases the lock if this guard still owns it.
    ///
    /// A guard whose key expired (or was taken over) gets `NotOwner` and
    /// deletes nothing; that case is logged as a warning.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Store` if the release script fails.
    pub async fn release(self) -> Result<ReleaseOutcome, LockError> {
        let held_for = self.held_for();
        let released = self
            .store
            .compare_and_delete(
                &self.key,
                &self.token,
                Some((self.channel.as_str(), RELEASED_MESSAGE)),
            )
            .await?;

        if released {
            tracing::debug!(held_for = ?held_for, "Released exclusive lock");
            Ok(ReleaseOutcome::Released)
        } else {
            counter!("gpulane.lock.release_anomaly").increment(1);
            tracing::warn!(
                held_for = ?held_for,
                "Lock was no longer ours at release (expired or taken over); nothing deleted"
            );
            Ok(ReleaseOutcome::NotOwner)
        }
    }
}
