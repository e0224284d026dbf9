//! LRU bookkeeping for the per-domain session pool.
//!
//! Pure data structure so the eviction policy can be tested without a
//! browser. The pool itself wraps this in a lock; session *use* happens
//! outside that lock.

use std::collections::HashMap;
use std::time::Instant;

struct Slot<P> {
    handle: P,
    last_used: Instant,
}

/// Bounded map of domain -> session handle with LRU eviction.
pub struct LruSessions<P> {
    slots: HashMap<String, Slot<P>>,
    capacity: usize,
}

impl<P: Clone> LruSessions<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Look up a domain's session, marking it as just used.
    pub fn touch(&mut self, domain: &str) -> Option<P> {
        let slot = self.slots.get_mut(domain)?;
        slot.last_used = Instant::now();
        Some(slot.handle.clone())
    }

    /// Insert a session for a domain. Returns handles that must be closed:
    /// the LRU victim if the pool was full, and any session this insert
    /// replaced for the same domain.
    pub fn insert(&mut self, domain: &str, handle: P) -> Vec<P> {
        let mut closed = Vec::new();

        if !self.slots.contains_key(domain) && self.slots.len() >= self.capacity {
            if let Some(victim) = self.lru_domain() {
                if let Some(slot) = self.slots.remove(&victim) {
                    closed.push(slot.handle);
                }
            }
        }

        if let Some(previous) = self.slots.insert(
            domain.to_string(),
            Slot {
                handle,
                last_used: Instant::now(),
            },
        ) {
            closed.push(previous.handle);
        }
        closed
    }

    fn lru_domain(&self) -> Option<String> {
        self.slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(domain, _)| domain.clone())
    }

    /// Remove every session, returning the handles for closing.
    pub fn drain(&mut self) -> Vec<P> {
        self.slots.drain().map(|(_, slot)| slot.handle).collect()
    }

    pub fn remove(&mut self, domain: &str) -> Option<P> {
        self.slots.remove(domain).map(|slot| slot.handle)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn domains(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_bound_holds_under_churn() {
        let mut pool: LruSessions<u32> = LruSessions::new(3);
        for i in 0..7u32 {
            pool.insert(&format!("domain{i}.example"), i);
        }
        assert_eq!(pool.len(), 3);

        // Survivors are the three most recently inserted.
        let mut domains = pool.domains();
        domains.sort();
        assert_eq!(
            domains,
            vec!["domain4.example", "domain5.example", "domain6.example"]
        );
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let mut pool: LruSessions<u32> = LruSessions::new(2);
        pool.insert("a.example", 0);
        pool.insert("b.example", 1);

        // "a" becomes most recently used, so "b" is the next victim.
        assert_eq!(pool.touch("a.example"), Some(0));
        let closed = pool.insert("c.example", 2);
        assert_eq!(closed, vec![1]);
        assert!(pool.touch("a.example").is_some());
        assert!(pool.touch("b.example").is_none());
    }

    #[test]
    fn test_reinsert_same_domain_replaces() {
        let mut pool: LruSessions<u32> = LruSessions::new(2);
        pool.insert("a.example", 0);
        let closed = pool.insert("a.example", 5);
        assert_eq!(closed, vec![0]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.touch("a.example"), Some(5));
    }

    #[test]
    fn test_drain_empties_pool() {
        let mut pool: LruSessions<u32> = LruSessions::new(4);
        pool.insert("a.example", 0);
        pool.insert("b.example", 1);
        let mut handles = pool.drain();
        handles.sort();
        assert_eq!(handles, vec![0, 1]);
        assert!(pool.is_empty());
    }
}
