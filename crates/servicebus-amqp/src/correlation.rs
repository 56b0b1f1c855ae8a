//! Time-to-live keyed store.
//!
//! Holds lock tokens obtained through the management channel so that a later
//! settlement can find the lock context without an active receive link.
//! Entries whose expiry has passed read as absent immediately; a background
//! sweep removes them so the store does not grow between reads.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

#[cfg(test)]
#[path = "correlation_tests.rs"]
mod tests;

/// Stored value with its absolute expiry.
struct StoreEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> StoreEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Entries<K, V> = RwLock<HashMap<K, StoreEntry<V>>>;

/// Thread-safe keyed store whose entries expire after a per-entry TTL.
pub struct ExpiringStore<K, V> {
    entries: Arc<Entries<K, V>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<K, V> ExpiringStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a store without a background sweep.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            sweeper: None,
        }
    }

    /// Create a store swept every `interval`.
    ///
    /// Must be called from within a Tokio runtime. The sweep task only holds a
    /// weak reference to the entries and ends when the store is dropped.
    pub fn with_sweep(interval: Duration) -> Self {
        let entries: Arc<Entries<K, V>> = Arc::new(RwLock::new(HashMap::new()));
        let weak = Arc::downgrade(&entries);
        let sweeper = tokio::spawn(sweep_periodically(weak, interval));

        Self {
            entries,
            sweeper: Some(sweeper),
        }
    }

    /// Insert or overwrite `key`, expiring `ttl` from now.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, StoreEntry { value, expires_at });
    }

    /// Value for `key`, `None` when absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`, returning its value when it had not expired.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_entries(&self.entries)
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn stored_len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<K, V> Default for ExpiringStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for ExpiringStore<K, V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn sweep_entries<K: Eq + Hash, V>(entries: &Entries<K, V>) -> usize {
    let now = Instant::now();
    let mut entries = entries.write().unwrap_or_else(PoisonError::into_inner);
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}

async fn sweep_periodically<K: Eq + Hash, V>(entries: Weak<Entries<K, V>>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            break;
        };
        let removed = sweep_entries(&entries);
        if removed > 0 {
            trace!(removed, "Swept expired entries");
        }
    }
}
