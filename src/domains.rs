//! Sharded per-domain state map.
//!
//! Every manager keys its mutable state by domain. The outer map lock is
//! held only long enough to clone out the per-domain handle, so work on one
//! domain never blocks another, and nothing holds a lock across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

struct Entry<T> {
    state: Arc<Mutex<T>>,
    last_touched: Instant,
}

/// Concurrent map of per-domain state with TTL eviction.
///
/// Long-running processes see many distinct domains; entries idle longer
/// than `ttl` are dropped by [`DomainMap::evict_stale`].
pub struct DomainMap<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
    ttl: Duration,
}

impl<T> DomainMap<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get the handle for a domain, creating state lazily via `init`.
    pub async fn get_or_create<F>(&self, domain: &str, init: F) -> Arc<Mutex<T>>
    where
        F: FnOnce() -> T,
    {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(domain) {
            entry.last_touched = Instant::now();
            return entry.state.clone();
        }
        let state = Arc::new(Mutex::new(init()));
        entries.insert(
            domain.to_string(),
            Entry {
                state: state.clone(),
                last_touched: Instant::now(),
            },
        );
        state
    }

    /// Get the handle for a domain if it exists, without creating it.
    pub async fn get(&self, domain: &str) -> Option<Arc<Mutex<T>>> {
        let entries = self.entries.read().await;
        entries.get(domain).map(|e| e.state.clone())
    }

    /// Drop domains idle longer than the TTL. Returns how many were removed.
    pub async fn evict_stale(&self) -> usize {
        let cutoff = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| cutoff.duration_since(e.last_touched) < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot of all domain keys, for stats surfaces.
    pub async fn domains(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let map: DomainMap<u32> = DomainMap::new(Duration::from_secs(60));
        let a = map.get_or_create("example.com", || 1).await;
        *a.lock().await += 1;

        let b = map.get_or_create("example.com", || 100).await;
        assert_eq!(*b.lock().await, 2);
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_without_create() {
        let map: DomainMap<u32> = DomainMap::new(Duration::from_secs(60));
        assert!(map.get("missing.example").await.is_none());
        map.get_or_create("example.com", || 0).await;
        assert!(map.get("example.com").await.is_some());
    }

    #[tokio::test]
    async fn test_evict_stale_drops_idle_domains() {
        let map: DomainMap<u32> = DomainMap::new(Duration::from_millis(10));
        map.get_or_create("a.example", || 0).await;
        map.get_or_create("b.example", || 0).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        map.get_or_create("c.example", || 0).await;

        let removed = map.evict_stale().await;
        assert_eq!(removed, 2);
        assert!(map.get("c.example").await.is_some());
    }
}
