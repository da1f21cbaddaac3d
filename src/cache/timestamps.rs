//! Per-entity "last modified" timestamps kept in the backend.
//!
//! Timestamps are microseconds since the Unix epoch. A bump stores
//! `max(previous + 1, now)`, so concurrent bumps and clock skew between
//! workers can never make a timestamp go backwards or repeat.

use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::domain::entities::EntityKey;

use super::backend::CacheBackend;
use super::error::BackendError;
use super::keys::KeySpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000;
        Self(i64::try_from(micros).unwrap_or(i64::MAX))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    /// Whole seconds, the resolution of HTTP dates.
    pub fn unix_seconds(self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    pub fn to_offset_datetime(self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct TimestampStore {
    backend: Arc<dyn CacheBackend>,
    keys: KeySpace,
}

impl TimestampStore {
    pub fn new(backend: Arc<dyn CacheBackend>, keys: KeySpace) -> Self {
        Self { backend, keys }
    }

    /// Advances the entity's timestamp and returns the new value.
    pub async fn bump(&self, entity: &EntityKey) -> Result<Timestamp, BackendError> {
        self.backend
            .advance(&self.keys.timestamp(entity), Timestamp::now().as_micros())
            .await
            .map(Timestamp)
    }

    /// The stored timestamp, or `None` if the entity was never touched or seen.
    pub async fn get(&self, entity: &EntityKey) -> Result<Option<Timestamp>, BackendError> {
        Ok(self
            .backend
            .counter(&self.keys.timestamp(entity))
            .await?
            .map(Timestamp))
    }

    /// Like [`get`](Self::get), but records "now" for entities without a
    /// timestamp so validators handed to browsers stay stable afterwards.
    pub async fn current(&self, entity: &EntityKey) -> Result<Timestamp, BackendError> {
        self.backend
            .counter_or_init(&self.keys.timestamp(entity), Timestamp::now().as_micros())
            .await
            .map(Timestamp)
    }
}
