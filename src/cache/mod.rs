//! Dependency-aware render cache.
//!
//! Three levels cooperate:
//!
//! - **Browser**: conditional GET against per-entity timestamps ([`http`]).
//! - **Render cache**: rendered fragments keyed by entity and caller
//!   settings ([`RenderCache`]).
//! - **Key registry**: per-entity lists of render keys, drained whenever the
//!   entity is touched ([`KeyRegistry`]).
//!
//! Writes reach the cache as touches. A touch drains the entity's registry,
//! deletes what it drained, bumps the entity timestamp, and repeats for every
//! dependent entity declared in the [`DependencyGraph`].
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! key_prefix = "lab"
//! entry_ttl_seconds = 300
//! lock_timeout_ms = 6000
//! # ... see config.rs for all options
//! ```

mod backend;
mod config;
pub mod deps;
mod engine;
mod error;
mod graph;
pub mod http;
mod keys;
pub(crate) mod lock;
mod propagator;
mod registry;
mod render;
mod retry;
mod stats;
mod timestamps;
mod trigger;

pub use backend::{CacheBackend, MemoryBackend};
pub use config::CacheConfig;
pub use engine::CacheEngine;
pub use error::{BackendError, CacheError, GraphError, RenderError, ResolveError};
pub use graph::{DependencyEdge, DependencyGraph, DependencyGraphBuilder, FnResolver, Resolver};
pub use http::{ConditionalGet, PageRequest, Precondition, Validators};
pub use keys::{KeySpace, RenderKey, SettingsHash};
pub use lock::{EntityLockGuard, EntityLocks, LockOutcome};
pub use propagator::{TouchPropagator, TouchReport};
pub use registry::KeyRegistry;
pub use render::{RenderCache, RenderOutput, RenderSource, Rendered};
pub use retry::RetryPolicy;
pub use stats::{AccessWeights, RenderStats};
pub use timestamps::{Timestamp, TimestampStore};
pub use trigger::CoherenceHandler;
