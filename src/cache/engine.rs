//! Wires every cache component around one backend and one graph.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::domain::entities::EntityKey;
use crate::domain::events::ChangeBus;

use super::backend::{CacheBackend, MemoryBackend};
use super::config::CacheConfig;
use super::error::{CacheError, RenderError};
use super::graph::DependencyGraph;
use super::http::ConditionalGet;
use super::keys::SettingsHash;
use super::propagator::{TouchPropagator, TouchReport};
use super::render::{RenderCache, RenderOutput, Rendered};
use super::timestamps::TimestampStore;
use super::trigger::CoherenceHandler;

/// Cheap to clone; clones share the backend and graph.
#[derive(Clone)]
pub struct CacheEngine {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    propagator: TouchPropagator,
    render: RenderCache,
}

impl CacheEngine {
    pub fn new(
        config: CacheConfig,
        backend: Arc<dyn CacheBackend>,
        graph: DependencyGraph,
    ) -> Self {
        info!(
            key_prefix = %config.key_prefix,
            edges = graph.edges().len(),
            max_depth = graph.max_depth(),
            "Cache engine ready"
        );
        let graph = Arc::new(graph);
        Self {
            propagator: TouchPropagator::new(graph, backend.clone(), &config),
            render: RenderCache::new(backend.clone(), &config),
            backend,
            config,
        }
    }

    /// Engine over a fresh [`MemoryBackend`].
    pub fn in_memory(config: CacheConfig, graph: DependencyGraph) -> Self {
        let backend = Arc::new(MemoryBackend::new(&config));
        Self::new(config, backend, graph)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn propagator(&self) -> &TouchPropagator {
        &self.propagator
    }

    pub fn render_cache(&self) -> &RenderCache {
        &self.render
    }

    pub fn timestamps(&self) -> &TimestampStore {
        self.render.timestamps()
    }

    pub fn conditional_get(&self) -> ConditionalGet {
        ConditionalGet::new(self.render.clone())
    }

    /// Subscribes touch propagation to `bus`.
    pub fn attach(&self, bus: &ChangeBus) {
        bus.subscribe(Arc::new(CoherenceHandler::new(self.propagator.clone())));
    }

    pub async fn touch(&self, entity: &EntityKey) -> Result<TouchReport, CacheError> {
        self.propagator.touch(entity).await
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
        self.render.get_or_render(entity, settings, render).await
    }
}
