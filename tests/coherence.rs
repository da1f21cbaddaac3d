//! Invalidation behaviour of a full engine over the lab graph.

mod common;

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use quire::cache::{
    CacheBackend, CacheConfig, CacheEngine, CacheError, DependencyGraph, FnResolver, KeyRegistry,
    KeySpace, Rendered, ResolveError, SettingsHash, deps,
};
use quire::domain::entities::{EntityId, EntityKey, EntityKind};
use quire::domain::events::{ChangeBus, ChangeKind};
use quire::domain::lab::Relation;
use tokio::time::timeout;

use common::{fast_config, flaky_engine, lab_engine};

const TTL: Duration = Duration::from_secs(60);

fn en() -> SettingsHash {
    SettingsHash::from_raw("en")
}

fn registry(engine: &CacheEngine) -> KeyRegistry {
    KeyRegistry::new(
        engine.backend().clone(),
        KeySpace::new(engine.config().key_prefix.clone()),
        engine.config(),
    )
}

async fn render_text(
    engine: &CacheEngine,
    entity: &EntityKey,
    body: &'static str,
) -> quire::cache::RenderOutput {
    engine
        .get_or_render(entity, &en(), |_| async move {
            Ok::<_, Infallible>(Rendered::new(body))
        })
        .await
        .expect("render succeeds")
}

#[tokio::test]
async fn touch_then_render_then_touch_again() {
    let (backend, _, engine) = lab_engine(CacheConfig::default());
    let s1 = EntityKey::sample("S1");

    backend.set("r1", Bytes::from_static(b"old"), TTL).await.unwrap();
    backend.list_push("keys:sample:S1", "r1", TTL).await.unwrap();
    let t0 = engine.timestamps().bump(&s1).await.unwrap();

    engine.touch(&s1).await.unwrap();

    assert!(registry(&engine).registered(&s1).await.unwrap().is_empty());
    assert!(backend.get("r1").await.unwrap().is_none());
    let t1 = engine.timestamps().get(&s1).await.unwrap().unwrap();
    assert!(t1 > t0);

    let output = render_text(&engine, &s1, "fresh").await;
    assert!(!output.is_hit());
    let r2 = "render:sample:S1:en".to_string();
    assert_eq!(registry(&engine).registered(&s1).await.unwrap(), [r2.clone()]);
    assert_eq!(backend.get(&r2).await.unwrap().unwrap(), "fresh");

    let report = engine.touch(&s1).await.unwrap();
    assert_eq!(report.keys_deleted, 1);
    assert!(backend.get(&r2).await.unwrap().is_none());
}

#[tokio::test]
async fn sample_touch_drains_containing_series() {
    let (backend, lab, engine) = lab_engine(CacheConfig::default());
    lab.link(Relation::SampleSeries, "S1", "SS1");
    let s1 = EntityKey::sample("S1");
    let ss1 = EntityKey::sample_series("SS1");

    // The series page embeds its members, so rendering it records S1.
    let member = s1.clone();
    engine
        .get_or_render(&ss1, &en(), |_| async move {
            deps::record(member);
            Ok::<_, Infallible>(Rendered::new("series with S1"))
        })
        .await
        .unwrap();
    let series_key = "render:sample-series:SS1:en";
    assert!(backend.get(series_key).await.unwrap().is_some());

    let report = engine.touch(&s1).await.unwrap();

    assert!(report.contains(&ss1));
    assert!(registry(&engine).registered(&ss1).await.unwrap().is_empty());
    assert!(registry(&engine).registered(&s1).await.unwrap().is_empty());
    assert!(backend.get(series_key).await.unwrap().is_none());
}

#[tokio::test]
async fn dependent_render_is_invalidated_by_contributor_touch() {
    let (_, lab, engine) = lab_engine(CacheConfig::default());
    lab.link(Relation::UserSamples, "alice", "S1");
    let alice = EntityKey::new(EntityKind::User, "alice");
    let s1 = EntityKey::sample("S1");

    let owner = Arc::new(std::sync::Mutex::new("Alice"));
    let render = |owner: Arc<std::sync::Mutex<&'static str>>, contributor: EntityKey| {
        move |_: EntityKey| async move {
            let name = *owner.lock().unwrap();
            Ok::<_, Infallible>(
                Rendered::new(format!("S1 owned by {name}")).with_contributor(contributor),
            )
        }
    };

    let first = engine
        .get_or_render(&s1, &en(), render(owner.clone(), alice.clone()))
        .await
        .unwrap();
    assert_eq!(first.body, "S1 owned by Alice");

    *owner.lock().unwrap() = "Alicia";
    let report = engine.touch(&alice).await.unwrap();
    assert!(report.contains(&s1));

    let second = engine
        .get_or_render(&s1, &en(), render(owner.clone(), alice.clone()))
        .await
        .unwrap();
    assert!(!second.is_hit());
    assert_eq!(second.body, "S1 owned by Alicia");
}

#[tokio::test]
async fn touching_twice_matches_touching_once() {
    let (backend, _, engine) = lab_engine(CacheConfig::default());
    let s1 = EntityKey::sample("S1");
    render_text(&engine, &s1, "page").await;

    let first = engine.touch(&s1).await.unwrap();
    let after_first = engine.timestamps().get(&s1).await.unwrap().unwrap();
    let second = engine.touch(&s1).await.unwrap();
    let after_second = engine.timestamps().get(&s1).await.unwrap().unwrap();

    assert_eq!(first.keys_deleted, 1);
    assert_eq!(second.keys_deleted, 0);
    assert!(after_second > after_first);
    assert!(registry(&engine).registered(&s1).await.unwrap().is_empty());
    assert!(backend.is_empty());
}

#[tokio::test]
async fn cyclic_graph_terminates() {
    let to_series = Arc::new(FnResolver::new(|_id: EntityId| async {
        Ok::<_, ResolveError>(vec![EntityId::new("B")])
    }));
    let to_sample = Arc::new(FnResolver::new(|_id: EntityId| async {
        Ok::<_, ResolveError>(vec![EntityId::new("A")])
    }));
    let graph = DependencyGraph::builder()
        .edge(EntityKind::Sample, EntityKind::SampleSeries, 50, "a-b", to_series)
        .edge(EntityKind::SampleSeries, EntityKind::Sample, 50, "b-a", to_sample)
        .build()
        .unwrap();
    let engine = CacheEngine::in_memory(CacheConfig::default(), graph);

    let report = timeout(Duration::from_secs(5), engine.touch(&EntityKey::sample("A")))
        .await
        .expect("touch terminates")
        .unwrap();

    assert_eq!(
        report.touched,
        [EntityKey::sample("A"), EntityKey::sample_series("B")]
    );
}

#[tokio::test]
async fn append_before_touch_is_never_lost() {
    let (backend, _, engine) = lab_engine(CacheConfig::default());
    let s1 = EntityKey::sample("S1");
    let registry = registry(&engine);

    backend.set("k", Bytes::from_static(b"v"), TTL).await.unwrap();
    assert!(registry.append(&s1, "k").await);

    let report = engine.touch(&s1).await.unwrap();

    assert_eq!(report.keys_deleted, 1);
    assert!(backend.get("k").await.unwrap().is_none());
}

#[tokio::test]
async fn held_lock_fails_open() {
    let (backend, _, engine) = lab_engine(fast_config());
    let s1 = EntityKey::sample("S1");
    backend
        .add("lock:sample:S1", "crashed-worker", Duration::from_secs(600))
        .await
        .unwrap();

    let report = timeout(Duration::from_secs(2), engine.touch(&s1))
        .await
        .expect("touch returns despite the held lock")
        .unwrap();
    assert_eq!(report.lock_timeouts, 1);
    assert!(report.contains(&s1));

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let calls = calls.clone();
        let output = timeout(
            Duration::from_secs(2),
            engine.get_or_render(&s1, &en(), |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Rendered::new("page"))
            }),
        )
        .await
        .expect("render returns despite the held lock")
        .unwrap();
        assert!(!output.is_hit());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(backend.get("render:sample:S1:en").await.unwrap().is_none());
}

#[tokio::test]
async fn unavailable_backend_renders_uncached() {
    let (backend, engine) = flaky_engine(fast_config(), DependencyGraph::empty());
    let s1 = EntityKey::sample("S1");
    backend.set_down(true);

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let calls = calls.clone();
        let output = engine
            .get_or_render(&s1, &en(), |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Rendered::new("page"))
            })
            .await
            .unwrap();
        assert!(!output.is_hit());
        assert_eq!(output.body, "page");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = engine.touch(&s1).await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::RetriesExhausted {
            op: "drain",
            attempts: 3,
            ..
        }
    ));

    backend.set_down(false);
    assert!(backend.inner().is_empty());
    render_text(&engine, &s1, "page").await;
    assert!(render_text(&engine, &s1, "page").await.is_hit());
}

#[tokio::test]
async fn bus_events_drive_invalidation() {
    let (backend, lab, engine) = lab_engine(CacheConfig::default());
    lab.link(Relation::TopicMembers, "T1", "bob");
    let bus = ChangeBus::new();
    engine.attach(&bus);

    let s1 = EntityKey::sample("S1");
    let topic = EntityKey::new(EntityKind::Topic, "T1");
    let bob = EntityKey::user_settings("bob");

    render_text(&engine, &bob, "bob's samples").await;
    bus.publish(
        topic.clone(),
        ChangeKind::RelationAdded { other: s1.clone() },
    )
    .await;
    assert!(
        backend
            .get("render:user-settings:bob:en")
            .await
            .unwrap()
            .is_none()
    );
    assert!(engine.timestamps().get(&s1).await.unwrap().is_some());

    render_text(&engine, &s1, "sample page").await;
    bus.publish(s1.clone(), ChangeKind::Deleted).await;

    let err = engine
        .get_or_render(&s1, &en(), |_| async {
            Ok::<_, Infallible>(Rendered::new("resurrected"))
        })
        .await
        .unwrap_err();
    assert!(err.is_gone());
    assert!(backend.get("render:sample:S1:en").await.unwrap().is_none());
}

/// Renders sample S1, embedding the process 7 fragment through a nested lookup.
async fn render_sample_with_process(
    engine: &CacheEngine,
    process_body: &'static str,
) -> quire::cache::RenderOutput {
    let nested = engine.clone();
    engine
        .get_or_render(&EntityKey::sample("S1"), &en(), |_| async move {
            let process = nested
                .get_or_render(&EntityKey::process("7"), &en(), |_| async move {
                    Ok::<_, Infallible>(Rendered::new(process_body))
                })
                .await
                .expect("process fragment renders");
            let mut body = b"sample+".to_vec();
            body.extend_from_slice(&process.body);
            Ok::<_, Infallible>(Rendered::new(body))
        })
        .await
        .expect("sample renders")
}

#[tokio::test]
async fn nested_render_is_invalidated_by_embedded_entity_touch() {
    let engine = CacheEngine::in_memory(CacheConfig::default(), DependencyGraph::empty());
    let process = EntityKey::process("7");

    let first = render_sample_with_process(&engine, "proc v1").await;
    assert_eq!(first.body, "sample+proc v1");
    assert!(
        registry(&engine)
            .registered(&process)
            .await
            .unwrap()
            .contains(&"render:sample:S1:en".to_string())
    );

    engine.touch(&process).await.unwrap();

    let second = render_sample_with_process(&engine, "proc v2").await;
    assert!(!second.is_hit());
    assert_eq!(second.body, "sample+proc v2");
}

#[tokio::test]
async fn nested_hit_registers_the_outer_render() {
    let engine = CacheEngine::in_memory(CacheConfig::default(), DependencyGraph::empty());
    let process = EntityKey::process("7");
    render_text(&engine, &process, "proc").await;

    let page = render_sample_with_process(&engine, "unused").await;
    assert_eq!(page.body, "sample+proc");

    assert_eq!(
        registry(&engine).registered(&process).await.unwrap(),
        ["render:process:7:en", "render:sample:S1:en"]
    );
}

#[tokio::test]
async fn contributor_touched_during_render_is_drained_by_its_next_touch() {
    let engine = CacheEngine::in_memory(CacheConfig::default(), DependencyGraph::empty());
    let s1 = EntityKey::sample("S1");
    let p7 = EntityKey::process("7");
    let key = "render:sample:S1:en";

    let writer = engine.clone();
    let contributor = p7.clone();
    let output = engine
        .get_or_render(&s1, &en(), |_| async move {
            deps::record(contributor.clone());
            // The process is committed after the render read it.
            writer.touch(&contributor).await.expect("touch succeeds");
            Ok::<_, Infallible>(Rendered::new("sample with old process"))
        })
        .await
        .unwrap();
    assert!(!output.is_hit());

    // The entry survives this cycle, but it is registered under the process.
    assert!(engine.backend().get(key).await.unwrap().is_some());
    assert_eq!(registry(&engine).registered(&p7).await.unwrap(), [key]);

    let report = engine.touch(&p7).await.unwrap();
    assert_eq!(report.keys_deleted, 1);
    assert!(engine.backend().get(key).await.unwrap().is_none());

    let next = render_text(&engine, &s1, "sample with new process").await;
    assert!(!next.is_hit());
    assert_eq!(next.body, "sample with new process");
}
