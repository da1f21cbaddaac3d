//! Bridges store change notifications to touch propagation.

use async_trait::async_trait;
use tracing::debug;

use crate::domain::events::{ChangeEvent, ChangeHandler, ChangeKind, HandlerError};

use super::error::CacheError;
use super::propagator::{TouchPropagator, TouchReport};

/// Subscribes the propagator to a [`ChangeBus`](crate::domain::events::ChangeBus).
///
/// ```ignore
/// bus.subscribe(Arc::new(CoherenceHandler::new(engine.propagator().clone())));
/// bus.publish(EntityKey::sample(id), ChangeKind::Updated).await;
/// ```
#[derive(Clone)]
pub struct CoherenceHandler {
    propagator: TouchPropagator,
}

impl CoherenceHandler {
    pub fn new(propagator: TouchPropagator) -> Self {
        Self { propagator }
    }

    /// Runs the propagation matching one change.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<TouchReport, CacheError> {
        match &event.change {
            ChangeKind::Updated => self.propagator.touch(&event.entity).await,
            ChangeKind::RelationAdded { other } | ChangeKind::RelationRemoved { other } => {
                self.propagator.relation_changed(&event.entity, other).await
            }
            ChangeKind::Deleted => self.propagator.delete(&event.entity).await,
        }
    }
}

#[async_trait]
impl ChangeHandler for CoherenceHandler {
    fn name(&self) -> &'static str {
        "cache-coherence"
    }

    async fn on_change(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let report = self.apply(event).await?;
        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            touched = report.touched.len(),
            "Change invalidated"
        );
        Ok(())
    }
}
