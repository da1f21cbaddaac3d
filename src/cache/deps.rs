//! Contributor collection during a render.
//!
//! Render code calls [`record`] for every entity whose state it reads. The
//! render cache wraps each render in [`with_collector`] and registers the
//! resulting key under every recorded entity. A nested render cache lookup
//! reports its own dependencies to the enclosing collector once it returns.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::future::Future;

use crate::domain::entities::EntityKey;

tokio::task_local! {
    static DEPS: RefCell<BTreeSet<EntityKey>>;
}

/// Record that the current render depends on `entity`.
///
/// Outside a collector the call is ignored.
///
/// ```ignore
/// quire::cache::deps::record(EntityKey::process(process_id));
/// let process = store.load_process(process_id).await?;
/// ```
pub fn record(entity: EntityKey) {
    let _ = DEPS.try_with(|deps| {
        deps.borrow_mut().insert(entity);
    });
}

/// Returns true when called inside [`with_collector`].
pub fn is_collecting() -> bool {
    DEPS.try_with(|_| ()).is_ok()
}

/// Run `fut` with a fresh collector and return its output along with every
/// entity recorded while it ran.
pub async fn with_collector<F, R>(fut: F) -> (R, BTreeSet<EntityKey>)
where
    F: Future<Output = R>,
{
    DEPS.scope(RefCell::new(BTreeSet::new()), async move {
        let output = fut.await;
        let collected = DEPS.with(|deps| deps.take());
        (output, collected)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_without_collector_is_no_op() {
        record(EntityKey::sample("1"));
        assert!(!is_collecting());
    }

    #[tokio::test]
    async fn with_collector_captures_dependencies() {
        let ((), deps) = with_collector(async {
            assert!(is_collecting());
            record(EntityKey::sample("1"));
            tokio::task::yield_now().await;
            record(EntityKey::process("2"));
        })
        .await;

        assert_eq!(
            deps.into_iter().collect::<Vec<_>>(),
            vec![EntityKey::sample("1"), EntityKey::process("2")]
        );
    }

    #[tokio::test]
    async fn record_deduplicates() {
        let ((), deps) = with_collector(async {
            for _ in 0..3 {
                record(EntityKey::sample("1"));
            }
        })
        .await;

        assert_eq!(deps.len(), 1);
    }

    #[tokio::test]
    async fn nested_collectors_are_isolated() {
        let (inner, outer) = with_collector(async {
            record(EntityKey::sample("outer"));
            let ((), inner) = with_collector(async {
                record(EntityKey::sample("inner"));
            })
            .await;
            inner
        })
        .await;

        assert!(inner.contains(&EntityKey::sample("inner")));
        assert!(!outer.contains(&EntityKey::sample("inner")));
        assert!(outer.contains(&EntityKey::sample("outer")));
    }
}
