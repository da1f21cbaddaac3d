//! Change notifications from the entity store.
//!
//! The store publishes one [`ChangeEvent`] after every committing write. The
//! bus hands it to each subscribed [`ChangeHandler`] synchronously, in
//! registration order, and only returns once all of them finished, so a
//! write is never acknowledged before its invalidation ran.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::lock::{read_or_recover, write_or_recover};

use super::entities::EntityKey;

const SOURCE: &str = "domain::events";

/// Monotonic sequence number assigned by the bus.
pub type Epoch = u64;

pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Nature of a committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Plain field update of the entity itself.
    Updated,
    /// A many-to-many link between the entity and `other` was created.
    RelationAdded { other: EntityKey },
    /// A many-to-many link between the entity and `other` was removed.
    RelationRemoved { other: EntityKey },
    /// The entity no longer exists.
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Unique identifier, useful to correlate log lines.
    pub id: Uuid,
    pub epoch: Epoch,
    pub entity: EntityKey,
    pub change: ChangeKind,
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(entity: EntityKey, change: ChangeKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            entity,
            change,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    async fn on_change(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}

/// Explicitly owned replacement for globally registered signal receivers.
pub struct ChangeBus {
    handlers: RwLock<Vec<Arc<dyn ChangeHandler>>>,
    epoch_counter: AtomicU64,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn ChangeHandler>) {
        info!(handler = handler.name(), "Change handler subscribed");
        write_or_recover(&self.handlers, SOURCE, "subscribe").push(handler);
    }

    pub fn handler_count(&self) -> usize {
        read_or_recover(&self.handlers, SOURCE, "handler_count").len()
    }

    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a change and run every handler before returning.
    ///
    /// A failing handler is logged; later handlers still run.
    pub async fn publish(&self, entity: EntityKey, change: ChangeKind) -> ChangeEvent {
        let event = ChangeEvent::new(entity, change, self.next_epoch());
        let handlers = read_or_recover(&self.handlers, SOURCE, "publish").clone();

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            entity = %event.entity,
            change = ?event.change,
            handlers = handlers.len(),
            "Change published"
        );

        for handler in handlers {
            if let Err(error) = handler.on_change(&event).await {
                warn!(
                    event_id = %event.id,
                    handler = handler.name(),
                    entity = %event.entity,
                    error = %error,
                    "Change handler failed"
                );
            }
        }

        event
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, Epoch)>>>,
        fail: bool,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_change(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push((self.name, event.epoch));
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            bus.subscribe(Arc::new(Recorder {
                name,
                seen: seen.clone(),
                fail: false,
            }));
        }

        bus.publish(EntityKey::sample("1"), ChangeKind::Updated).await;

        assert_eq!(*seen.lock().unwrap(), vec![("first", 0), ("second", 0)]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_later_handlers() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Arc::new(Recorder {
            name: "broken",
            seen: seen.clone(),
            fail: true,
        }));
        bus.subscribe(Arc::new(Recorder {
            name: "healthy",
            seen: seen.clone(),
            fail: false,
        }));

        bus.publish(EntityKey::process("9"), ChangeKind::Deleted).await;

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn epochs_increase_per_publish() {
        let bus = ChangeBus::new();
        let first = bus.publish(EntityKey::sample("1"), ChangeKind::Updated).await;
        let second = bus.publish(EntityKey::sample("1"), ChangeKind::Updated).await;

        assert!(first.epoch < second.epoch);
        assert_ne!(first.id, second.id);
        assert_eq!(bus.handler_count(), 0);
    }
}
