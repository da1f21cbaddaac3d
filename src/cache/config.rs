//! Cache tuning knobs, resolved from the `[cache]` section of `quire.toml`.

use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_ENTRY_TTL_SECONDS: u64 = 300;
pub(crate) const DEFAULT_REGISTRY_TTL_SLACK_SECONDS: u64 = 10;
pub(crate) const DEFAULT_LOCK_TIMEOUT_MS: u64 = 6_000;
pub(crate) const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 25;
pub(crate) const DEFAULT_LOCK_TTL_MS: u64 = 10_000;
pub(crate) const DEFAULT_DRAIN_RETRY_INITIAL_MS: u64 = 50;
pub(crate) const DEFAULT_DRAIN_RETRY_MAX_MS: u64 = 2_000;
pub(crate) const DEFAULT_MAX_TOUCH_ENTITIES: usize = 10_000;
pub(crate) const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prepended to every backend key.
    pub key_prefix: String,
    /// Lifetime of a rendered entry.
    pub entry_ttl_seconds: u64,
    /// Extra lifetime of key registry lists beyond the entries they track.
    pub registry_ttl_slack_seconds: u64,
    /// How long to wait for an entity lock before failing open.
    pub lock_timeout_ms: u64,
    pub lock_retry_interval_ms: u64,
    /// Expiry of a lock token, bounding how long a crashed holder blocks others.
    pub lock_ttl_ms: u64,
    pub drain_retry_initial_ms: u64,
    pub drain_retry_max_ms: u64,
    /// Retry budget for drains and deletions during a touch; `0` retries forever.
    pub drain_max_attempts: u32,
    /// Upper bound on entities visited by a single propagation.
    pub max_touch_entities: usize,
    /// Capacity of the in-process backend's evictable value store.
    pub memory_capacity: usize,
    /// Record hit/miss counters in the backend.
    pub stats_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            entry_ttl_seconds: DEFAULT_ENTRY_TTL_SECONDS,
            registry_ttl_slack_seconds: DEFAULT_REGISTRY_TTL_SLACK_SECONDS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            drain_retry_initial_ms: DEFAULT_DRAIN_RETRY_INITIAL_MS,
            drain_retry_max_ms: DEFAULT_DRAIN_RETRY_MAX_MS,
            drain_max_attempts: 0,
            max_touch_entities: DEFAULT_MAX_TOUCH_ENTITIES,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            stats_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_seconds)
    }

    /// Registry lists must outlive every entry they point at.
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_seconds + self.registry_ttl_slack_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn drain_retry_initial(&self) -> Duration {
        Duration::from_millis(self.drain_retry_initial_ms)
    }

    pub fn drain_retry_max(&self) -> Duration {
        Duration::from_millis(self.drain_retry_max_ms.max(self.drain_retry_initial_ms))
    }

    /// `None` means unbounded.
    pub fn drain_attempt_limit(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.drain_max_attempts)
    }

    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
