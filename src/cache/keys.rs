//! Backend key layout.
//!
//! ```text
//! render:{kind}:{id}:{settings}[:{context}]   rendered bytes (evictable)
//! keys:{kind}:{id}                            render keys derived from the entity
//! lock:{kind}:{id}                            mutual-exclusion token
//! ts:{kind}:{id}                              last-modified timestamp
//! gone:{kind}:{id}                            deletion tombstone
//! stats:hits / stats:misses                   weighted access counters
//! ```
//!
//! Every key is prefixed with the configured namespace, if any. In render
//! keys, `%` and `:` inside the id and settings segments are percent-encoded
//! so the segment boundaries stay unambiguous.

use std::borrow::Cow;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::domain::entities::EntityKey;

use super::stats::AccessWeights;

const PART_SEPARATOR: &[u8] = b"\x03";

/// Summary of caller-specific rendering parameters (language, browser
/// system, display options). Entities render differently per settings, so
/// the hash is part of the render key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingsHash(String);

impl SettingsHash {
    /// Hash the given parts with SHA-256, separated by `0x03`.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(digest_parts(parts))
    }

    /// Use a precomputed hash as-is.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SettingsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one render-cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderKey {
    entity: EntityKey,
    settings: SettingsHash,
    context: Option<String>,
    /// Statistics weight of a lookup; not part of the backend key.
    weights: AccessWeights,
}

impl RenderKey {
    pub fn new(entity: EntityKey, settings: SettingsHash) -> Self {
        Self {
            entity,
            settings,
            context: None,
            weights: AccessWeights::default(),
        }
    }

    /// Distinguish renders of the same entity that depend on where the
    /// entity is embedded, e.g. a sample split shown on a child sample's page.
    pub fn with_context<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.context = Some(digest_parts(parts));
        self
    }

    /// Count a hit of this entry as `hit` hits and a miss as `miss` misses.
    pub fn with_weights(mut self, hit: u32, miss: u32) -> Self {
        self.weights = AccessWeights::new(hit, miss);
        self
    }

    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub fn weights(&self) -> AccessWeights {
        self.weights
    }

    pub fn settings(&self) -> &SettingsHash {
        &self.settings
    }
}

/// Builds namespaced backend keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.is_empty() || prefix.ends_with(':') {
            prefix
        } else {
            format!("{prefix}:")
        };
        Self { prefix }
    }

    pub fn render(&self, key: &RenderKey) -> String {
        let entity = &key.entity;
        let id = escape_segment(entity.id.as_str());
        let settings = escape_segment(key.settings.as_str());
        match &key.context {
            Some(context) => format!(
                "{}render:{}:{id}:{settings}:{context}",
                self.prefix, entity.kind
            ),
            None => format!("{}render:{}:{id}:{settings}", self.prefix, entity.kind),
        }
    }

    pub fn registry(&self, entity: &EntityKey) -> String {
        self.scoped("keys", entity)
    }

    pub fn lock(&self, entity: &EntityKey) -> String {
        self.scoped("lock", entity)
    }

    pub fn timestamp(&self, entity: &EntityKey) -> String {
        self.scoped("ts", entity)
    }

    pub fn tombstone(&self, entity: &EntityKey) -> String {
        self.scoped("gone", entity)
    }

    pub fn hits(&self) -> String {
        format!("{}stats:hits", self.prefix)
    }

    pub fn misses(&self) -> String {
        format!("{}stats:misses", self.prefix)
    }

    fn scoped(&self, namespace: &str, entity: &EntityKey) -> String {
        format!("{}{namespace}:{}:{}", self.prefix, entity.kind, entity.id)
    }
}

fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains([':', '%']) {
        return Cow::Borrowed(segment);
    }
    let mut escaped = String::with_capacity(segment.len() + 4);
    for ch in segment.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

fn digest_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for (index, part) in parts.into_iter().enumerate() {
        if index > 0 {
            hasher.update(PART_SEPARATOR);
        }
        hasher.update(part.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}
