//! Entity model, change notifications, and the lab dependency graph.

pub mod entities;
pub mod error;
pub mod events;
pub mod lab;
