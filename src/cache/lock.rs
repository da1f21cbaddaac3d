//! Locking: poison-tolerant access to in-process state, and per-entity
//! mutual exclusion across workers through the backend.

use std::fmt;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::Duration;

use metrics::counter;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::entities::EntityKey;

use super::backend::CacheBackend;
use super::config::CacheConfig;
use super::error::BackendError;
use super::keys::KeySpace;

fn recovered<G>(
    poisoned: PoisonError<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    warn!(
        op,
        target_module = target,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned lock; state may be stale after a panic elsewhere"
    );
    poisoned.into_inner()
}

pub(crate) fn read_or_recover<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recovered(poisoned, target, op, "rwlock.read"))
}

pub(crate) fn write_or_recover<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recovered(poisoned, target, op, "rwlock.write"))
}

pub(crate) fn lock_or_recover<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recovered(poisoned, target, op, "mutex.lock"))
}

/// Result of trying to enter an entity's critical section.
#[derive(Debug)]
pub enum LockOutcome {
    Held(EntityLockGuard),
    /// Another holder kept the lock for the whole timeout.
    TimedOut,
    /// The backend could not be asked.
    Unavailable(BackendError),
}

/// Backend-level mutex keyed by `lock:{kind}:{id}`.
///
/// Every attempt uses a fresh random token; release only deletes the key if
/// it still carries that token, so a lock that expired and was taken over is
/// never released by its former holder.
#[derive(Clone)]
pub struct EntityLocks {
    backend: Arc<dyn CacheBackend>,
    keys: KeySpace,
    timeout: Duration,
    retry_interval: Duration,
    ttl: Duration,
}

impl EntityLocks {
    pub fn new(backend: Arc<dyn CacheBackend>, keys: KeySpace, config: &CacheConfig) -> Self {
        Self {
            backend,
            keys,
            timeout: config.lock_timeout(),
            retry_interval: config.lock_retry_interval(),
            ttl: config.lock_ttl(),
        }
    }

    /// Polls until the lock is granted or the timeout elapses.
    pub async fn acquire(&self, entity: &EntityKey) -> LockOutcome {
        let key = self.keys.lock(entity);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.backend.add(&key, &token, self.ttl).await {
                Ok(true) => {
                    return LockOutcome::Held(EntityLockGuard {
                        backend: self.backend.clone(),
                        entity: entity.clone(),
                        key,
                        token,
                    });
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(entity = %entity, error = %error, "Entity lock unavailable");
                    return LockOutcome::Unavailable(error);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                counter!("quire_lock_timeout_total").increment(1);
                warn!(
                    entity = %entity,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Entity lock timed out; continuing without it"
                );
                return LockOutcome::TimedOut;
            }
            sleep(self.retry_interval.min(deadline - now)).await;
        }
    }
}

/// Proof of holding an entity lock. Must be released explicitly.
#[must_use = "an unreleased lock blocks the entity until its TTL expires"]
pub struct EntityLockGuard {
    backend: Arc<dyn CacheBackend>,
    entity: EntityKey,
    key: String,
    token: String,
}

impl fmt::Debug for EntityLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLockGuard")
            .field("entity", &self.entity)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl EntityLockGuard {
    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub async fn release(self) {
        match self.backend.delete_if_eq(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => debug!(
                entity = %self.entity,
                "Entity lock expired before release"
            ),
            Err(error) => warn!(
                entity = %self.entity,
                error = %error,
                "Failed to release entity lock; it expires with its TTL"
            ),
        }
    }
}
