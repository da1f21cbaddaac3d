//! Declarative dependency graph.
//!
//! Each edge says "when an entity of kind `from` changes, the entities of
//! kind `to` returned by the resolver must be touched too". The graph is
//! built once at startup and never mutated afterwards.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::entities::{EntityId, EntityKind};

use super::error::{GraphError, ResolveError};

/// Computes the ids of entities that depend on a changed entity.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, id: &EntityId) -> Result<Vec<EntityId>, ResolveError>;
}

/// Adapts an async closure into a [`Resolver`].
pub struct FnResolver<F, Fut> {
    func: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnResolver<F, Fut>
where
    F: Fn(EntityId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<EntityId>, ResolveError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Resolver for FnResolver<F, Fut>
where
    F: Fn(EntityId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<EntityId>, ResolveError>> + Send,
{
    async fn resolve(&self, id: &EntityId) -> Result<Vec<EntityId>, ResolveError> {
        (self.func)(id.clone()).await
    }
}

#[derive(Clone)]
pub struct DependencyEdge {
    pub from: EntityKind,
    pub to: EntityKind,
    /// Greatest propagation depth at which this edge still fires. The
    /// directly touched entity sits at depth 0, so an edge with
    /// `max_hops = 1` only fires for the entity that was touched itself.
    pub max_hops: u32,
    pub label: &'static str,
    pub resolver: Arc<dyn Resolver>,
}

impl DependencyEdge {
    pub fn follows_at(&self, depth: u32) -> bool {
        depth < self.max_hops
    }
}

impl fmt::Debug for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyEdge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("max_hops", &self.max_hops)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn builder() -> DependencyGraphBuilder {
        DependencyGraphBuilder::default()
    }

    /// A graph without edges: touches never propagate.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Edges leaving `kind`, in declaration order.
    pub fn outgoing(&self, kind: EntityKind) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter().filter(move |edge| edge.from == kind)
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Greatest `max_hops` over all edges; no propagation is deeper than this.
    pub fn max_depth(&self) -> u32 {
        self.edges.iter().map(|edge| edge.max_hops).max().unwrap_or(0)
    }
}

#[derive(Default)]
pub struct DependencyGraphBuilder {
    edges: Vec<DependencyEdge>,
}

impl DependencyGraphBuilder {
    pub fn edge(
        mut self,
        from: EntityKind,
        to: EntityKind,
        max_hops: u32,
        label: &'static str,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        self.edges.push(DependencyEdge {
            from,
            to,
            max_hops,
            label,
            resolver,
        });
        self
    }

    /// Validates the declaration. Every edge needs an explicit bound of at
    /// least one hop and a unique label.
    pub fn build(self) -> Result<DependencyGraph, GraphError> {
        let mut labels = HashSet::new();
        for edge in &self.edges {
            if edge.max_hops == 0 {
                return Err(GraphError::UnboundedEdge {
                    label: edge.label,
                    from: edge.from,
                    to: edge.to,
                });
            }
            if !labels.insert(edge.label) {
                return Err(GraphError::DuplicateEdge { label: edge.label });
            }
        }
        Ok(DependencyGraph { edges: self.edges })
    }
}
