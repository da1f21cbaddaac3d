#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quire::cache::{
    BackendError, CacheBackend, CacheConfig, CacheEngine, DependencyGraph, MemoryBackend,
};
use quire::domain::lab::{self, MemoryLab};

/// Wraps a [`MemoryBackend`] and fails every call while switched off.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    down: AtomicBool,
    tombstones_down: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fails only tombstone reads, leaving everything else working.
    pub fn set_tombstones_down(&self, down: bool) {
        self.tombstones_down.store(down, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.down.load(Ordering::SeqCst) {
            Err(BackendError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), BackendError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, BackendError> {
        self.check()?;
        self.inner.delete_many(keys).await
    }

    async fn add(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.add(key, token, ttl).await
    }

    async fn delete_if_eq(&self, key: &str, token: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.delete_if_eq(key, token).await
    }

    async fn list_push(&self, key: &str, item: &str, ttl: Duration) -> Result<(), BackendError> {
        self.check()?;
        self.inner.list_push(key, item, ttl).await
    }

    async fn list_take(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.check()?;
        self.inner.list_take(key).await
    }

    async fn list_read(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.check()?;
        self.inner.list_read(key).await
    }

    async fn advance(&self, key: &str, floor: i64) -> Result<i64, BackendError> {
        self.check()?;
        self.inner.advance(key, floor).await
    }

    async fn counter(&self, key: &str) -> Result<Option<i64>, BackendError> {
        self.check()?;
        if key.contains("gone:") && self.tombstones_down.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("tombstone shard offline"));
        }
        self.inner.counter(key).await
    }

    async fn counter_or_init(&self, key: &str, initial: i64) -> Result<i64, BackendError> {
        self.check()?;
        self.inner.counter_or_init(key, initial).await
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, BackendError> {
        self.check()?;
        self.inner.incr(key, by).await
    }
}

/// Short timeouts so lock-related tests finish quickly.
pub fn fast_config() -> CacheConfig {
    CacheConfig {
        lock_timeout_ms: 100,
        lock_retry_interval_ms: 5,
        lock_ttl_ms: 10_000,
        drain_retry_initial_ms: 1,
        drain_retry_max_ms: 4,
        drain_max_attempts: 3,
        ..CacheConfig::default()
    }
}

/// Engine over a shared [`MemoryBackend`] and the lab graph.
pub fn lab_engine(config: CacheConfig) -> (Arc<MemoryBackend>, Arc<MemoryLab>, CacheEngine) {
    let relations = Arc::new(MemoryLab::new());
    let graph = lab::dependency_graph(relations.clone()).expect("lab graph");
    let backend = Arc::new(MemoryBackend::new(&config));
    let engine = CacheEngine::new(config, backend.clone(), graph);
    (backend, relations, engine)
}

pub fn flaky_engine(
    config: CacheConfig,
    graph: DependencyGraph,
) -> (Arc<FlakyBackend>, CacheEngine) {
    let backend = Arc::new(FlakyBackend::new());
    let engine = CacheEngine::new(config, backend.clone(), graph);
    (backend, engine)
}
