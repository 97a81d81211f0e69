//! Process-local at-most-once cache for commands.
//!
//! Keyed by `(sender, idempotency key)`; a hit inside the TTL returns the
//! stored response without re-invoking the handler. The cache is bounded
//! LRU: inserting past capacity evicts the least recently used entry.
//! Cancelled dispatches never populate it. Callers needing idempotency
//! across restarts must persist responses themselves.

use silo_types::Response;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedEntry {
    response: Response,
    stored_at: Instant,
    last_used: u64,
}

/// Bounded LRU of prior command responses.
#[derive(Debug)]
pub struct IdempotencyCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<(String, String), CachedEntry>,
    tick: u64,
}

impl IdempotencyCache {
    /// Create a cache holding at most `capacity` entries for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Look up a prior response for `(sender, key)`.
    ///
    /// Expired entries are removed on lookup; a hit refreshes recency.
    pub fn get(&self, sender: &str, key: &str) -> Option<Response> {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        let map_key = (sender.to_string(), key.to_string());

        match inner.entries.get_mut(&map_key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                entry.last_used = tick;
                Some(entry.response.clone())
            }
            Some(_) => {
                inner.entries.remove(&map_key);
                None
            }
            None => None,
        }
    }

    /// Store the response for `(sender, key)`, evicting the least recently
    /// used entry when at capacity.
    pub fn store(&self, sender: &str, key: &str, response: Response) {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;

        if inner.entries.len() >= self.capacity
            && !inner
                .entries
                .contains_key(&(sender.to_string(), key.to_string()))
        {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            (sender.to_string(), key.to_string()),
            CachedEntry {
                response,
                stored_at: Instant::now(),
                last_used: tick,
            },
        );
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency lock poisoned").entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
