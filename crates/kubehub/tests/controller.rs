use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{EventType, WatchKey};
use beacon_kubehub::{apply_event, Change, Controller, ControllerConfig, Informer, Reaction};
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(EventType, WatchKey, Option<String>)>>,
    /// Fail this many invocations before succeeding.
    fail_first: AtomicU32,
    calls: AtomicU32,
}

impl Recorder {
    fn failing(n: u32) -> Self { Self { fail_first: AtomicU32::new(n), ..Default::default() } }
    fn seen(&self) -> Vec<(EventType, WatchKey, Option<String>)> { self.seen.lock().unwrap().clone() }
}

#[async_trait]
impl Reaction<Pod> for Recorder {
    async fn react(&self, change: Change<Pod>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (key, rv) = match &change {
            Change::Created(p) | Change::Updated(p) => (WatchKey::from_meta(&p.metadata)?, p.metadata.resource_version.clone()),
            Change::Deleted(k) => (k.clone(), None),
        };
        self.seen.lock().unwrap().push((change.event_type(), key, rv));
        let left = self.fail_first.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_first.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("transient failure");
        }
        Ok(())
    }
}

fn pod(name: &str, rv: &str, created: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": { "name": name, "namespace": "default", "resourceVersion": rv, "creationTimestamp": created }
    }))
    .unwrap()
}

const OLD: &str = "2020-01-01T00:00:00Z";
const NEW: &str = "2030-01-01T00:00:00Z";

fn controller(reaction: Arc<dyn Reaction<Pod>>) -> Arc<Controller<Pod>> {
    let started = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    Arc::new(Controller::<Pod>::new("pods", reaction, ControllerConfig::default()).with_started_at(started))
}

fn feed(ctrl: &Controller<Pod>, event: watcher::Event<Pod>) {
    for ev in apply_event(&ctrl.indexer(), event) {
        ctrl.enqueue(ev);
    }
}

async fn drain(ctrl: &Arc<Controller<Pod>>) {
    let workers = ctrl.spawn_workers();
    tokio::time::sleep(Duration::from_secs(5)).await;
    ctrl.queue().shut_down();
    for w in workers {
        w.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn burst_is_coalesced_into_one_create_with_latest_state() {
    let rec = Arc::new(Recorder::default());
    let ctrl = controller(rec.clone());
    feed(&ctrl, watcher::Event::Applied(pod("web", "1", NEW)));
    feed(&ctrl, watcher::Event::Applied(pod("web", "2", NEW)));
    feed(&ctrl, watcher::Event::Applied(pod("web", "3", NEW)));
    drain(&ctrl).await;
    assert_eq!(rec.seen(), vec![(EventType::Create, WatchKey::namespaced("default", "web"), Some("3".into()))]);
}

#[tokio::test(start_paused = true)]
async fn creates_of_objects_older_than_startup_are_suppressed() {
    let rec = Arc::new(Recorder::default());
    let ctrl = controller(rec.clone());
    feed(&ctrl, watcher::Event::Restarted(vec![pod("old", "1", OLD), pod("fresh", "1", NEW)]));
    drain(&ctrl).await;
    assert_eq!(rec.seen(), vec![(EventType::Create, WatchKey::namespaced("default", "fresh"), Some("1".into()))]);
    assert_eq!(ctrl.indexer().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn updates_and_deletes_of_preexisting_objects_flow() {
    let rec = Arc::new(Recorder::default());
    let ctrl = controller(rec.clone());
    feed(&ctrl, watcher::Event::Restarted(vec![pod("old", "1", OLD)]));
    let workers = ctrl.spawn_workers();
    tokio::time::sleep(Duration::from_secs(1)).await;
    feed(&ctrl, watcher::Event::Applied(pod("old", "2", OLD)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    feed(&ctrl, watcher::Event::Deleted(pod("old", "2", OLD)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    ctrl.queue().shut_down();
    for w in workers {
        w.await.unwrap();
    }
    let key = WatchKey::namespaced("default", "old");
    assert_eq!(rec.seen(), vec![(EventType::Update, key.clone(), Some("2".into())), (EventType::Delete, key, None)]);
}

#[tokio::test(start_paused = true)]
async fn create_then_delete_before_processing_is_a_delete() {
    let rec = Arc::new(Recorder::default());
    let ctrl = controller(rec.clone());
    feed(&ctrl, watcher::Event::Applied(pod("blip", "1", NEW)));
    feed(&ctrl, watcher::Event::Deleted(pod("blip", "1", NEW)));
    drain(&ctrl).await;
    assert_eq!(rec.seen(), vec![(EventType::Delete, WatchKey::namespaced("default", "blip"), None)]);
}

#[tokio::test(start_paused = true)]
async fn failing_key_is_dropped_after_five_attempts() {
    let rec = Arc::new(Recorder::failing(u32::MAX));
    let ctrl = controller(rec.clone());
    feed(&ctrl, watcher::Event::Applied(pod("web", "1", NEW)));
    drain(&ctrl).await;
    assert_eq!(rec.calls.load(Ordering::SeqCst), 5);
    // every retry still carries the original create
    assert!(rec.seen().iter().all(|(kind, _, _)| *kind == EventType::Create));
    assert_eq!(ctrl.queue().num_requeues(&WatchKey::namespaced("default", "web")), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_and_resets_backoff() {
    let rec = Arc::new(Recorder::failing(2));
    let ctrl = controller(rec.clone());
    feed(&ctrl, watcher::Event::Applied(pod("web", "1", NEW)));
    drain(&ctrl).await;
    assert_eq!(rec.calls.load(Ordering::SeqCst), 3);
    assert_eq!(ctrl.queue().num_requeues(&WatchKey::namespaced("default", "web")), 0);
}

#[tokio::test(start_paused = true)]
async fn process_next_returns_false_after_shutdown() {
    let ctrl = controller(Arc::new(Recorder::default()));
    ctrl.queue().shut_down();
    assert!(!ctrl.process_next().await);
}

/// Sleeps through every reaction, noting which keys started and finished.
#[derive(Default)]
struct Sleeper {
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

#[async_trait]
impl Reaction<Pod> for Sleeper {
    async fn react(&self, change: Change<Pod>) -> anyhow::Result<()> {
        let name = match &change {
            Change::Created(p) | Change::Updated(p) => p.metadata.name.clone().unwrap_or_default(),
            Change::Deleted(k) => k.name().to_string(),
        };
        self.started.lock().unwrap().push(name.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        self.finished.lock().unwrap().push(name);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_finishes_in_flight_reaction_and_hands_out_nothing_more() {
    let sleeper = Arc::new(Sleeper::default());
    let ctrl = controller(sleeper.clone());
    let events = futures::stream::iter(vec![
        Ok::<_, watcher::Error>(watcher::Event::Applied(pod("a", "1", NEW))),
        Ok(watcher::Event::Applied(pod("b", "1", NEW))),
    ])
    .chain(futures::stream::pending());
    let informer = Informer::from_stream("pods", events, ctrl.indexer());
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&ctrl).run(informer, shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*sleeper.started.lock().unwrap(), vec!["a"]);
    assert_eq!(ctrl.queue().len(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(30), run).await.expect("run returns after cancel").unwrap();
    assert_eq!(*sleeper.finished.lock().unwrap(), vec!["a"]);
    assert_eq!(*sleeper.started.lock().unwrap(), vec!["a"]);
    assert!(ctrl.queue().is_shutting_down());
}
