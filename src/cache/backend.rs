//! Key-value backend abstraction.
//!
//! Workers never share memory, only a backend, so every coordination step
//! (locks, registry lists, timestamps) is expressed through the atomic
//! primitives below. Each call is one round-trip and atomic on its own.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::error::BackendError;
use super::lock::lock_or_recover;

const SOURCE: &str = "cache::backend";

#[async_trait]
pub trait CacheBackend: Send + Sync {
    // ------------------------------------------------------------------
    // Evictable values
    // ------------------------------------------------------------------

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), BackendError>;

    /// Removes the keys and returns how many were present.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, BackendError>;

    // ------------------------------------------------------------------
    // Lock tokens
    // ------------------------------------------------------------------

    /// Stores `token` only if `key` is absent. Returns whether it was stored.
    async fn add(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Removes `key` only if it still holds `token`.
    async fn delete_if_eq(&self, key: &str, token: &str) -> Result<bool, BackendError>;

    // ------------------------------------------------------------------
    // Lists (ordered, duplicate-free)
    // ------------------------------------------------------------------

    /// Appends `item` unless already present and refreshes the list TTL.
    async fn list_push(&self, key: &str, item: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Returns the list and empties it in one step.
    async fn list_take(&self, key: &str) -> Result<Vec<String>, BackendError>;

    async fn list_read(&self, key: &str) -> Result<Vec<String>, BackendError>;

    // ------------------------------------------------------------------
    // Counters (never expire)
    // ------------------------------------------------------------------

    /// Stores `max(current + 1, floor)` and returns it. An absent counter
    /// counts as `floor - 1`.
    async fn advance(&self, key: &str, floor: i64) -> Result<i64, BackendError>;

    async fn counter(&self, key: &str) -> Result<Option<i64>, BackendError>;

    /// Stores `initial` if the counter is absent and returns the stored value.
    async fn counter_or_init(&self, key: &str, initial: i64) -> Result<i64, BackendError>;

    async fn incr(&self, key: &str, by: i64) -> Result<i64, BackendError>;
}

#[derive(Debug, Clone)]
struct Slot<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Slot<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct State {
    values: LruCache<String, Slot<Bytes>>,
    tokens: HashMap<String, Slot<String>>,
    lists: HashMap<String, Slot<Vec<String>>>,
    counters: HashMap<String, i64>,
}

impl State {
    fn live_token(&mut self, key: &str, now: Instant) -> Option<&String> {
        if self.tokens.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.tokens.remove(key);
        }
        self.tokens.get(key).map(|slot| &slot.value)
    }

    fn live_list(&mut self, key: &str, now: Instant) -> Option<&mut Slot<Vec<String>>> {
        if self.lists.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.lists.remove(key);
        }
        self.lists.get_mut(key)
    }
}

/// In-process backend for single-process deployments and tests.
///
/// Rendered values are bounded by an LRU; tokens, lists and counters are
/// only ever removed explicitly or by their own TTL.
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(State {
                values: LruCache::new(config.memory_capacity_non_zero()),
                tokens: HashMap::new(),
                lists: HashMap::new(),
                counters: HashMap::new(),
            }),
        }
    }

    /// Number of stored evictable values, including expired ones not yet observed.
    pub fn len(&self) -> usize {
        lock_or_recover(&self.state, SOURCE, "len").values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every evictable value, simulating a backend restart of the value store.
    pub fn clear_values(&self) {
        lock_or_recover(&self.state, SOURCE, "clear_values")
            .values
            .clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state, SOURCE, "get");
        let found = state
            .values
            .get(key)
            .map(|slot| slot.is_live(now).then(|| slot.value.clone()));
        if let Some(None) = found {
            state.values.pop(key);
        }
        Ok(found.flatten())
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), BackendError> {
        lock_or_recover(&self.state, SOURCE, "set")
            .values
            .put(key.to_string(), Slot::new(value, ttl));
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, BackendError> {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state, SOURCE, "delete_many");
        let removed = keys
            .iter()
            .filter_map(|key| state.values.pop(key.as_str()))
            .filter(|slot| slot.is_live(now))
            .count();
        Ok(removed)
    }

    async fn add(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state, SOURCE, "add");
        if state.live_token(key, now).is_some() {
            return Ok(false);
        }
        state
            .tokens
            .insert(key.to_string(), Slot::new(token.to_string(), ttl));
        Ok(true)
    }

    async fn delete_if_eq(&self, key: &str, token: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state, SOURCE, "delete_if_eq");
        if state.live_token(key, now).is_some_and(|held| held == token) {
            state.tokens.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_push(&self, key: &str, item: &str, ttl: Duration) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state, SOURCE, "list_push");
        match state.live_list(key, now) {
            Some(slot) => {
                if !slot.value.iter().any(|existing| existing == item) {
                    slot.value.push(item.to_string());
                }
                slot.expires_at = now + ttl;
            }
            None => {
                state
                    .lists
                    .insert(key.to_string(), Slot::new(vec![item.to_string()], ttl));
            }
        }
        Ok(())
    }

    async fn list_take(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state, SOURCE, "list_take");
        Ok(state
            .lists
            .remove(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value)
            .unwrap_or_default())
    }

    async fn list_read(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let now = Instant::now();
        let mut state = lock_or_recover(&self.state, SOURCE, "list_read");
        Ok(state
            .live_list(key, now)
            .map(|slot| slot.value.clone())
            .unwrap_or_default())
    }

    async fn advance(&self, key: &str, floor: i64) -> Result<i64, BackendError> {
        let mut state = lock_or_recover(&self.state, SOURCE, "advance");
        let next = match state.counters.get(key) {
            Some(current) => current.saturating_add(1).max(floor),
            None => floor,
        };
        state.counters.insert(key.to_string(), next);
        Ok(next)
    }

    async fn counter(&self, key: &str) -> Result<Option<i64>, BackendError> {
        Ok(lock_or_recover(&self.state, SOURCE, "counter")
            .counters
            .get(key)
            .copied())
    }

    async fn counter_or_init(&self, key: &str, initial: i64) -> Result<i64, BackendError> {
        let mut state = lock_or_recover(&self.state, SOURCE, "counter_or_init");
        Ok(*state.counters.entry(key.to_string()).or_insert(initial))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, BackendError> {
        let mut state = lock_or_recover(&self.state, SOURCE, "incr");
        let value = state.counters.entry(key.to_string()).or_insert(0);
        *value = value.saturating_add(by);
        Ok(*value)
    }
}
