//! Quire: a dependency-aware render cache for laboratory records.
//!
//! Three cache levels cooperate here: browser conditional GET driven by
//! per-entity timestamps, a render cache keyed by entity and caller settings,
//! and a per-entity registry of the render keys derived from that entity's
//! current state. Writes "touch" an entity, which drains its registry,
//! bumps its timestamp and walks the declared dependency graph.

pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod simulate;
