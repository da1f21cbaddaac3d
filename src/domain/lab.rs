//! Dependency declaration for laboratory records.
//!
//! | From            | To              | Relation                     | Hops |
//! |-----------------|-----------------|------------------------------|------|
//! | process         | sample          | samples the process was on   | 2    |
//! | sample          | sample-series   | series containing the sample | 2    |
//! | sample          | sample          | pieces split off the sample  | 3    |
//! | result          | sample-series   | series the result belongs to | 2    |
//! | sample-series   | sample          | members of the series        | 2    |
//! | user            | process         | processes operated by user   | 1    |
//! | user            | sample          | samples owned by user        | 1    |
//! | user            | sample-series   | series owned by user         | 1    |
//! | user            | result          | results operated by user     | 1    |
//! | sample          | user-settings   | users watching the sample    | 1    |
//! | topic           | user-settings   | members of the topic         | 1    |
//!
//! Two hops let a user rename reach samples through their processes and
//! series through their results, and a result reach samples through its
//! series. Splits get a third hop so a
//! grandchild piece still shows its ancestor's history.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::cache::lock::{read_or_recover, write_or_recover};
use crate::cache::{DependencyGraph, GraphError, ResolveError, Resolver};

use super::entities::{EntityId, EntityKey, EntityKind};

const SOURCE: &str = "domain::lab";

/// Named relations the entity store can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    ProcessSamples,
    SampleSeries,
    SplitChildren,
    ResultSeries,
    SeriesMembers,
    UserProcesses,
    UserSamples,
    UserSeries,
    UserResults,
    SampleWatchers,
    TopicMembers,
}

impl Relation {
    pub fn label(self) -> &'static str {
        match self {
            Self::ProcessSamples => "process-samples",
            Self::SampleSeries => "sample-series",
            Self::SplitChildren => "split-children",
            Self::ResultSeries => "result-series",
            Self::SeriesMembers => "series-members",
            Self::UserProcesses => "user-processes",
            Self::UserSamples => "user-samples",
            Self::UserSeries => "user-series",
            Self::UserResults => "user-results",
            Self::SampleWatchers => "sample-watchers",
            Self::TopicMembers => "topic-members",
        }
    }
}

/// `(from, to, max_hops, relation)` for every edge of the lab graph.
pub const LAB_EDGES: [(EntityKind, EntityKind, u32, Relation); 11] = [
    (EntityKind::Process, EntityKind::Sample, 2, Relation::ProcessSamples),
    (EntityKind::Sample, EntityKind::SampleSeries, 2, Relation::SampleSeries),
    (EntityKind::Sample, EntityKind::Sample, 3, Relation::SplitChildren),
    (EntityKind::Result, EntityKind::SampleSeries, 2, Relation::ResultSeries),
    (EntityKind::SampleSeries, EntityKind::Sample, 2, Relation::SeriesMembers),
    (EntityKind::User, EntityKind::Process, 1, Relation::UserProcesses),
    (EntityKind::User, EntityKind::Sample, 1, Relation::UserSamples),
    (EntityKind::User, EntityKind::SampleSeries, 1, Relation::UserSeries),
    (EntityKind::User, EntityKind::Result, 1, Relation::UserResults),
    (EntityKind::Sample, EntityKind::UserSettings, 1, Relation::SampleWatchers),
    (EntityKind::Topic, EntityKind::UserSettings, 1, Relation::TopicMembers),
];

/// Relation lookups supplied by the entity store.
#[async_trait]
pub trait LabRelations: Send + Sync {
    async fn related(&self, relation: Relation, id: &EntityId)
    -> Result<Vec<EntityId>, ResolveError>;
}

struct RelationResolver {
    relations: Arc<dyn LabRelations>,
    relation: Relation,
}

#[async_trait]
impl Resolver for RelationResolver {
    async fn resolve(&self, id: &EntityId) -> Result<Vec<EntityId>, ResolveError> {
        self.relations.related(self.relation, id).await
    }
}

/// Builds the lab dependency graph over `relations`.
pub fn dependency_graph(
    relations: Arc<dyn LabRelations>,
) -> Result<DependencyGraph, GraphError> {
    LAB_EDGES
        .into_iter()
        .fold(DependencyGraph::builder(), |builder, (from, to, hops, relation)| {
            builder.edge(
                from,
                to,
                hops,
                relation.label(),
                Arc::new(RelationResolver {
                    relations: relations.clone(),
                    relation,
                }),
            )
        })
        .build()
}

/// In-memory relation store for tests and the workload simulator.
#[derive(Default)]
pub struct MemoryLab {
    links: RwLock<HashMap<(Relation, EntityId), Vec<EntityId>>>,
    missing: RwLock<HashSet<EntityKey>>,
}

impl MemoryLab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, relation: Relation, from: impl Into<EntityId>, to: impl Into<EntityId>) {
        let to = to.into();
        let mut links = write_or_recover(&self.links, SOURCE, "link");
        let targets = links.entry((relation, from.into())).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }

    pub fn unlink(&self, relation: Relation, from: impl Into<EntityId>, to: impl Into<EntityId>) {
        let to = to.into();
        if let Some(targets) =
            write_or_recover(&self.links, SOURCE, "unlink").get_mut(&(relation, from.into()))
        {
            targets.retain(|target| *target != to);
        }
    }

    /// Makes every lookup starting at `entity` fail as if it had been deleted.
    pub fn mark_missing(&self, entity: EntityKey) {
        write_or_recover(&self.missing, SOURCE, "mark_missing").insert(entity);
    }
}

#[async_trait]
impl LabRelations for MemoryLab {
    async fn related(
        &self,
        relation: Relation,
        id: &EntityId,
    ) -> Result<Vec<EntityId>, ResolveError> {
        let from = LAB_EDGES
            .iter()
            .find(|(_, _, _, candidate)| *candidate == relation)
            .map(|(from, ..)| *from);
        if let Some(kind) = from {
            let entity = EntityKey::new(kind, id.clone());
            if read_or_recover(&self.missing, SOURCE, "related").contains(&entity) {
                return Err(ResolveError::not_found(entity));
            }
        }

        Ok(read_or_recover(&self.links, SOURCE, "related")
            .get(&(relation, id.clone()))
            .cloned()
            .unwrap_or_default())
    }
}
