//! Render cache hit/miss accounting.
//!
//! Counts are kept twice: as `metrics` counters for the exporter of the
//! hosting process, and as backend counters shared by all workers so the
//! hit rate can be queried from any of them.

use std::sync::Arc;

use metrics::counter;
use tracing::debug;

use super::backend::CacheBackend;
use super::error::BackendError;
use super::keys::KeySpace;

const METRIC_RENDER_HIT: &str = "quire_render_hit_total";
const METRIC_RENDER_MISS: &str = "quire_render_miss_total";

/// How much one lookup counts towards the hit rate.
///
/// An expensive page can count for more than one hit, while its miss stays
/// cheap when rendering it goes through further cached fragments anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessWeights {
    pub hit: u32,
    pub miss: u32,
}

impl AccessWeights {
    pub const fn new(hit: u32, miss: u32) -> Self {
        Self { hit, miss }
    }
}

impl Default for AccessWeights {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[derive(Clone)]
pub struct RenderStats {
    backend: Arc<dyn CacheBackend>,
    keys: KeySpace,
    enabled: bool,
}

impl RenderStats {
    pub fn new(backend: Arc<dyn CacheBackend>, keys: KeySpace, enabled: bool) -> Self {
        Self {
            backend,
            keys,
            enabled,
        }
    }

    pub async fn record_hit(&self, weights: AccessWeights) {
        counter!(METRIC_RENDER_HIT).increment(u64::from(weights.hit));
        self.bump(self.keys.hits(), weights.hit).await;
    }

    pub async fn record_miss(&self, weights: AccessWeights) {
        counter!(METRIC_RENDER_MISS).increment(u64::from(weights.miss));
        self.bump(self.keys.misses(), weights.miss).await;
    }

    async fn bump(&self, key: String, weight: u32) {
        if !self.enabled || weight == 0 {
            return;
        }
        if let Err(error) = self.backend.incr(&key, i64::from(weight)).await {
            debug!(key = %key, error = %error, "Failed to record cache statistics");
        }
    }

    /// `(hits, misses)` recorded by all workers.
    pub async fn counts(&self) -> Result<(u64, u64), BackendError> {
        let hits = self.backend.counter(&self.keys.hits()).await?.unwrap_or(0);
        let misses = self.backend.counter(&self.keys.misses()).await?.unwrap_or(0);
        Ok((hits.max(0) as u64, misses.max(0) as u64))
    }

    /// Fraction of lookups served from the cache, `None` before the first lookup.
    pub async fn hit_rate(&self) -> Result<Option<f64>, BackendError> {
        let (hits, misses) = self.counts().await?;
        let total = hits + misses;
        Ok((total > 0).then(|| hits as f64 / total as f64))
    }
}
