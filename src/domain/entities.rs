//! Entity identity for everything that participates in caching.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::DomainError;

/// Closed set of cacheable entity kinds.
///
/// The tag returned by [`EntityKind::as_str`] is part of every backend key,
/// so it must never change for an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Sample,
    Process,
    SampleSeries,
    /// A result process, which can be attached to sample series.
    Result,
    Clearance,
    User,
    /// Per-user display settings ("my samples", topic memberships, layout).
    UserSettings,
    Topic,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Sample,
        EntityKind::Process,
        EntityKind::SampleSeries,
        EntityKind::Result,
        EntityKind::Clearance,
        EntityKind::User,
        EntityKind::UserSettings,
        EntityKind::Topic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::Process => "process",
            Self::SampleSeries => "sample-series",
            Self::Result => "result",
            Self::Clearance => "clearance",
            Self::User => "user",
            Self::UserSettings => "user-settings",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| DomainError::unknown_kind(value))
    }
}

/// Opaque identifier assigned by the entity store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// A `(kind, id)` pair naming one node of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn sample(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::Sample, id)
    }

    pub fn process(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::Process, id)
    }

    pub fn sample_series(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::SampleSeries, id)
    }

    pub fn user_settings(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::UserSettings, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
