//! Get-or-render facade used by request handlers.
//!
//! A miss renders outside of any lock while collecting contributors, then
//! stores the entry and registers its key under every contributor, each
//! registration under that contributor's entity lock. Store and registration
//! run in their own task so an abandoned request cannot stop halfway.
//!
//! Before storing, the rendered entity's timestamp is compared with the one
//! read before rendering, under its lock. A render that raced a touch of the
//! entity itself is therefore never stored. A touch of another contributor
//! that completes between its render-time read and its registration still
//! leaves the entry registered under that contributor, so it is deleted by
//! the contributor's next touch at the latest.
//!
//! Renders nest: a render that embeds another entry through a nested lookup
//! depends on it. The nested lookup records its entity in the enclosing
//! collector on a hit, and its entity plus every contributor on a fresh
//! render, so the outer key is registered under them as well.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::histogram;
use tracing::{debug, warn};

use crate::domain::entities::EntityKey;

use super::backend::CacheBackend;
use super::config::CacheConfig;
use super::deps;
use super::error::{BackendError, RenderError};
use super::keys::{KeySpace, RenderKey, SettingsHash};
use super::lock::{EntityLocks, LockOutcome};
use super::registry::KeyRegistry;
use super::stats::RenderStats;
use super::timestamps::{Timestamp, TimestampStore};

const METRIC_RENDER_MS: &str = "quire_render_ms";

/// Output of a render function.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub body: Bytes,
    /// Entities the body was derived from, besides those recorded through
    /// [`deps::record`] and the rendered entity itself.
    pub contributors: Vec<EntityKey>,
}

impl Rendered {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            contributors: Vec::new(),
        }
    }

    pub fn with_contributor(mut self, entity: EntityKey) -> Self {
        self.contributors.push(entity);
        self
    }

    pub fn with_contributors(mut self, entities: impl IntoIterator<Item = EntityKey>) -> Self {
        self.contributors.extend(entities);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderSource {
    Cache,
    Fresh,
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub body: Bytes,
    pub source: RenderSource,
}

impl RenderOutput {
    pub fn is_hit(&self) -> bool {
        self.source == RenderSource::Cache
    }
}

struct Inner {
    backend: Arc<dyn CacheBackend>,
    keys: KeySpace,
    registry: KeyRegistry,
    locks: EntityLocks,
    timestamps: TimestampStore,
    stats: RenderStats,
    entry_ttl: Duration,
}

#[derive(Clone)]
pub struct RenderCache {
    inner: Arc<Inner>,
}

impl RenderCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        let keys = KeySpace::new(config.key_prefix.clone());
        Self {
            inner: Arc::new(Inner {
                registry: KeyRegistry::new(backend.clone(), keys.clone(), config),
                locks: EntityLocks::new(backend.clone(), keys.clone(), config),
                timestamps: TimestampStore::new(backend.clone(), keys.clone()),
                stats: RenderStats::new(backend.clone(), keys.clone(), config.stats_enabled),
                entry_ttl: config.entry_ttl(),
                backend,
                keys,
            }),
        }
    }

    pub fn stats(&self) -> &RenderStats {
        &self.inner.stats
    }

    pub fn timestamps(&self) -> &TimestampStore {
        &self.inner.timestamps
    }

    /// Whether `entity` was deleted.
    pub async fn is_gone(&self, entity: &EntityKey) -> Result<bool, BackendError> {
        Ok(self
            .inner
            .backend
            .counter(&self.inner.keys.tombstone(entity))
            .await?
            .is_some())
    }

    pub async fn get_or_render<F, Fut, E>(
        &self,
        entity: &EntityKey,
        settings: &SettingsHash,
        render: F,
    ) -> Result<RenderOutput, RenderError<E>>
    where
        F: FnOnce(EntityKey) -> Fut,
        Fut: Future<Output = Result<Rendered, E>>,
    {
        self.get_or_render_keyed(RenderKey::new(entity.clone(), settings.clone()), render)
            .await
    }

    /// Like [`get_or_render`](Self::get_or_render) for a fully built key,
    /// e.g. one carrying a local-context discriminator.
    pub async fn get_or_render_keyed<F, Fut, E>(
        &self,
        key: RenderKey,
        render: F,
    ) -> Result<RenderOutput, RenderError<E>>
    where
        F: FnOnce(EntityKey) -> Fut,
        Fut: Future<Output = Result<Rendered, E>>,
    {
        let entity = key.entity().clone();
        let weights = key.weights();
        let backend_key = self.inner.keys.render(&key);
        // Without a working backend every request renders and nothing is stored.
        let mut degraded = false;

        match self.is_gone(&entity).await {
            Ok(true) => return Err(RenderError::Gone(entity)),
            Ok(false) => {}
            Err(error) => {
                warn!(
                    entity = %entity,
                    error = %error,
                    "Tombstone check failed; rendering uncached"
                );
                degraded = true;
            }
        }

        if !degraded {
            match self.inner.backend.get(&backend_key).await {
                Ok(Some(body)) => {
                    self.inner.stats.record_hit(weights).await;
                    deps::record(entity);
                    debug!(key = %backend_key, "Render cache hit");
                    return Ok(RenderOutput {
                        body,
                        source: RenderSource::Cache,
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(key = %backend_key, error = %error, "Render cache lookup failed");
                    degraded = true;
                }
            }
        }
        self.inner.stats.record_miss(weights).await;

        let observed = if degraded {
            None
        } else {
            match self.inner.timestamps.get(&entity).await {
                Ok(observed) => Some(observed),
                Err(error) => {
                    warn!(
                        entity = %entity,
                        error = %error,
                        "Timestamp read failed; rendering uncached"
                    );
                    None
                }
            }
        };

        let started_at = Instant::now();
        let (result, recorded) = deps::with_collector(render(entity.clone())).await;
        let rendered = result.map_err(RenderError::Render)?;
        histogram!(METRIC_RENDER_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        let mut contributors = recorded;
        contributors.extend(rendered.contributors);
        contributors.remove(&entity);

        deps::record(entity.clone());
        for contributor in &contributors {
            deps::record(contributor.clone());
        }

        if let Some(observed) = observed {
            let task = StoreTask {
                inner: self.inner.clone(),
                key: backend_key,
                entity,
                observed,
                contributors,
                body: rendered.body.clone(),
            };
            if let Err(error) = tokio::spawn(task.run()).await {
                warn!(error = %error, "Render store task aborted");
            }
        }

        Ok(RenderOutput {
            body: rendered.body,
            source: RenderSource::Fresh,
        })
    }
}

/// Stores one fresh render and registers it.
struct StoreTask {
    inner: Arc<Inner>,
    key: String,
    entity: EntityKey,
    /// Timestamp of `entity` read before rendering.
    observed: Option<Timestamp>,
    /// Contributors other than `entity`.
    contributors: BTreeSet<EntityKey>,
    body: Bytes,
}

impl StoreTask {
    async fn run(self) {
        if !self.store_primary().await {
            return;
        }
        for contributor in &self.contributors {
            if !self.register(contributor).await {
                self.discard("registration failed").await;
                return;
            }
        }
        debug!(
            key = %self.key,
            contributors = self.contributors.len() + 1,
            "Render stored"
        );
    }

    /// Writes the entry and registers it under the rendered entity, unless
    /// the entity was touched while rendering.
    async fn store_primary(&self) -> bool {
        let guard = match self.inner.locks.acquire(&self.entity).await {
            LockOutcome::Held(guard) => guard,
            LockOutcome::TimedOut | LockOutcome::Unavailable(_) => return false,
        };

        let stored = match self.inner.timestamps.get(&self.entity).await {
            Ok(current) if current == self.observed => self.write_and_append().await,
            Ok(_) => {
                debug!(
                    entity = %self.entity,
                    "Entity touched during render; result not stored"
                );
                false
            }
            Err(error) => {
                warn!(entity = %self.entity, error = %error, "Timestamp recheck failed");
                false
            }
        };

        guard.release().await;
        stored
    }

    async fn write_and_append(&self) -> bool {
        if let Err(error) = self
            .inner
            .backend
            .set(&self.key, self.body.clone(), self.inner.entry_ttl)
            .await
        {
            warn!(key = %self.key, error = %error, "Failed to store render");
            return false;
        }
        if !self.inner.registry.append(&self.entity, &self.key).await {
            self.discard("registration failed").await;
            return false;
        }
        true
    }

    async fn register(&self, contributor: &EntityKey) -> bool {
        match self.inner.locks.acquire(contributor).await {
            LockOutcome::Held(guard) => {
                let appended = self.inner.registry.append(contributor, &self.key).await;
                guard.release().await;
                appended
            }
            LockOutcome::TimedOut | LockOutcome::Unavailable(_) => false,
        }
    }

    async fn discard(&self, reason: &'static str) {
        match self
            .inner
            .backend
            .delete_many(std::slice::from_ref(&self.key))
            .await
        {
            Ok(_) => debug!(key = %self.key, reason, "Render discarded"),
            Err(error) => warn!(
                key = %self.key,
                reason,
                error = %error,
                "Failed to discard unregistered render; it lives until its TTL"
            ),
        }
    }
}
