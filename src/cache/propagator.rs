//! Touch propagation.
//!
//! A touch invalidates everything rendered from an entity's current state
//! and advances its timestamp, then walks the dependency graph breadth-first
//! to do the same for every dependent entity. Each (kind, id) is visited at
//! most once per propagation, which keeps cyclic graphs finite.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

use crate::domain::entities::EntityKey;

use super::backend::CacheBackend;
use super::config::CacheConfig;
use super::error::CacheError;
use super::graph::DependencyGraph;
use super::keys::KeySpace;
use super::lock::{EntityLocks, LockOutcome};
use super::registry::KeyRegistry;
use super::retry::RetryPolicy;
use super::timestamps::TimestampStore;

const METRIC_TOUCH_TOTAL: &str = "quire_touch_total";
const METRIC_TOUCH_KEYS_DELETED: &str = "quire_touch_keys_deleted_total";
const METRIC_TOUCH_MS: &str = "quire_touch_ms";

/// What a single propagation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchReport {
    /// Entities touched, in visit order.
    pub touched: Vec<EntityKey>,
    /// Registered render entries that were still present and got deleted.
    pub keys_deleted: usize,
    /// Resolver calls that failed and were skipped.
    pub resolver_failures: usize,
    /// Entities touched without their lock after a lock timeout.
    pub lock_timeouts: usize,
    /// Propagation stopped at `max_touch_entities`.
    pub truncated: bool,
}

impl TouchReport {
    pub fn contains(&self, entity: &EntityKey) -> bool {
        self.touched.contains(entity)
    }
}

#[derive(Clone)]
pub struct TouchPropagator {
    graph: Arc<DependencyGraph>,
    backend: Arc<dyn CacheBackend>,
    keys: KeySpace,
    registry: KeyRegistry,
    timestamps: TimestampStore,
    locks: EntityLocks,
    retry: RetryPolicy,
    max_entities: usize,
}

impl TouchPropagator {
    pub fn new(
        graph: Arc<DependencyGraph>,
        backend: Arc<dyn CacheBackend>,
        config: &CacheConfig,
    ) -> Self {
        let keys = KeySpace::new(config.key_prefix.clone());
        Self {
            registry: KeyRegistry::new(backend.clone(), keys.clone(), config),
            timestamps: TimestampStore::new(backend.clone(), keys.clone()),
            locks: EntityLocks::new(backend.clone(), keys.clone(), config),
            retry: RetryPolicy::from_config(config),
            max_entities: config.max_touch_entities.max(1),
            graph,
            backend,
            keys,
        }
    }

    /// Invalidate `entity` and everything that depends on it.
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn touch(&self, entity: &EntityKey) -> Result<TouchReport, CacheError> {
        self.propagate(vec![entity.clone()], "touch").await
    }

    /// Invalidate both sides of a many-to-many link that was added or
    /// removed, sharing one visited set.
    #[instrument(skip_all, fields(a = %a, b = %b))]
    pub async fn relation_changed(
        &self,
        a: &EntityKey,
        b: &EntityKey,
    ) -> Result<TouchReport, CacheError> {
        self.propagate(vec![a.clone(), b.clone()], "relation").await
    }

    /// Touch `entity`, then mark it permanently absent so no render of it is
    /// ever served or stored again.
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn delete(&self, entity: &EntityKey) -> Result<TouchReport, CacheError> {
        let report = self.propagate(vec![entity.clone()], "delete").await?;
        let tombstone = self.keys.tombstone(entity);
        self.retry
            .run("tombstone", entity, || self.backend.advance(&tombstone, 1))
            .await?;
        info!(entity = %entity, "Entity tombstoned");
        Ok(report)
    }

    async fn propagate(
        &self,
        roots: Vec<EntityKey>,
        mode: &'static str,
    ) -> Result<TouchReport, CacheError> {
        let started_at = Instant::now();
        let mut report = TouchReport::default();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        for root in roots {
            if visited.insert(root.clone()) {
                queue.push_back((root, 0u32));
            }
        }

        while let Some((entity, depth)) = queue.pop_front() {
            if report.touched.len() >= self.max_entities {
                report.truncated = true;
                warn!(
                    limit = self.max_entities,
                    pending = queue.len() + 1,
                    "Touch propagation truncated"
                );
                break;
            }

            self.touch_one(&entity, &mut report).await?;

            for edge in self
                .graph
                .outgoing(entity.kind)
                .filter(|edge| edge.follows_at(depth))
            {
                match edge.resolver.resolve(&entity.id).await {
                    Ok(ids) => {
                        for id in ids {
                            let dependent = EntityKey::new(edge.to, id);
                            if visited.insert(dependent.clone()) {
                                queue.push_back((dependent, depth + 1));
                            }
                        }
                    }
                    Err(error) => {
                        report.resolver_failures += 1;
                        warn!(
                            entity = %entity,
                            edge = edge.label,
                            error = %error,
                            "Dependency resolver failed; skipping edge"
                        );
                    }
                }
            }
        }

        counter!(METRIC_TOUCH_TOTAL).increment(report.touched.len() as u64);
        counter!(METRIC_TOUCH_KEYS_DELETED).increment(report.keys_deleted as u64);
        histogram!(METRIC_TOUCH_MS, "mode" => mode)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        info!(
            mode,
            touched = report.touched.len(),
            keys_deleted = report.keys_deleted,
            resolver_failures = report.resolver_failures,
            lock_timeouts = report.lock_timeouts,
            truncated = report.truncated,
            "Touch propagated"
        );

        Ok(report)
    }

    /// Drain, delete and bump one entity. The lock covers only this step and
    /// is released before any dependent is visited.
    async fn touch_one(
        &self,
        entity: &EntityKey,
        report: &mut TouchReport,
    ) -> Result<(), CacheError> {
        let guard = match self.locks.acquire(entity).await {
            LockOutcome::Held(guard) => Some(guard),
            LockOutcome::TimedOut => {
                report.lock_timeouts += 1;
                None
            }
            LockOutcome::Unavailable(_) => None,
        };

        let outcome = self.invalidate(entity).await;
        if let Some(guard) = guard {
            guard.release().await;
        }

        report.keys_deleted += outcome?;
        report.touched.push(entity.clone());
        Ok(())
    }

    async fn invalidate(&self, entity: &EntityKey) -> Result<usize, CacheError> {
        let drained = self.registry.drain_and_clear(entity).await?;
        let deleted = if drained.is_empty() {
            0
        } else {
            self.retry
                .run("delete", entity, || self.backend.delete_many(&drained))
                .await?
        };
        let timestamp = self
            .retry
            .run("bump", entity, || self.timestamps.bump(entity))
            .await?;

        debug!(
            entity = %entity,
            drained = drained.len(),
            deleted,
            timestamp = %timestamp,
            "Entity touched"
        );
        Ok(deleted)
    }
}
