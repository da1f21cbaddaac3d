//! Per-entity lists of render keys.
//!
//! `keys:{kind}:{id}` holds every render key derived from the entity's
//! current state. Rendering appends to it; touching drains it and deletes
//! what it drained. Callers serialize both operations for one entity through
//! [`EntityLocks`](super::lock::EntityLocks).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::entities::EntityKey;

use super::backend::CacheBackend;
use super::config::CacheConfig;
use super::error::{BackendError, CacheError};
use super::keys::KeySpace;
use super::retry::RetryPolicy;

#[derive(Clone)]
pub struct KeyRegistry {
    backend: Arc<dyn CacheBackend>,
    keys: KeySpace,
    list_ttl: Duration,
    retry: RetryPolicy,
}

impl KeyRegistry {
    pub fn new(backend: Arc<dyn CacheBackend>, keys: KeySpace, config: &CacheConfig) -> Self {
        Self {
            backend,
            keys,
            list_ttl: config.registry_ttl(),
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Registers `render_key` under `entity`. Best-effort: a failure is
    /// logged and reported as `false`.
    pub async fn append(&self, entity: &EntityKey, render_key: &str) -> bool {
        match self
            .backend
            .list_push(&self.keys.registry(entity), render_key, self.list_ttl)
            .await
        {
            Ok(()) => {
                debug!(entity = %entity, key = render_key, "Render key registered");
                true
            }
            Err(error) => {
                warn!(
                    entity = %entity,
                    key = render_key,
                    error = %error,
                    "Failed to register render key"
                );
                false
            }
        }
    }

    /// Returns every registered key and leaves the list empty. Retried per
    /// the drain policy, since a skipped drain keeps stale entries alive.
    pub async fn drain_and_clear(&self, entity: &EntityKey) -> Result<Vec<String>, CacheError> {
        let list = self.keys.registry(entity);
        self.retry
            .run("drain", entity, || self.backend.list_take(&list))
            .await
    }

    /// Current contents without draining.
    pub async fn registered(&self, entity: &EntityKey) -> Result<Vec<String>, BackendError> {
        self.backend.list_read(&self.keys.registry(entity)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;

    fn registry() -> KeyRegistry {
        KeyRegistry::new(
            Arc::new(MemoryBackend::default()),
            KeySpace::default(),
            &CacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn append_then_drain() {
        let registry = registry();
        let sample = EntityKey::sample("1");
        assert!(registry.append(&sample, "render:sample:1:en").await);
        assert!(registry.append(&sample, "render:sample:1:de").await);

        assert_eq!(
            registry.drain_and_clear(&sample).await.unwrap(),
            ["render:sample:1:en", "render:sample:1:de"]
        );
        assert!(registry.registered(&sample).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_are_per_entity() {
        let registry = registry();
        registry.append(&EntityKey::sample("1"), "a").await;
        registry.append(&EntityKey::process("1"), "b").await;

        assert_eq!(
            registry.drain_and_clear(&EntityKey::sample("1")).await.unwrap(),
            ["a"]
        );
        assert_eq!(
            registry.registered(&EntityKey::process("1")).await.unwrap(),
            ["b"]
        );
    }

    #[tokio::test]
    async fn draining_an_unknown_entity_is_empty() {
        let registry = registry();
        assert!(
            registry
                .drain_and_clear(&EntityKey::sample("404"))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
