//! List+watch one resource type into an [`Indexer`] and emit create/update/delete
//! notifications for every change.

use std::fmt::Debug;

use beacon_core::{EventType, InformerEvent, WatchKey};
use beacon_store::Indexer;
use futures::{stream::BoxStream, Stream, StreamExt};
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Resource,
};
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Informer<K> {
    name: String,
    events: BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>,
    indexer: Indexer<K>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Watch `api` with default settings and backoff.
    pub fn new(name: impl Into<String>, api: Api<K>, indexer: Indexer<K>) -> Self {
        Self::from_stream(name, watcher(api, watcher::Config::default()).default_backoff(), indexer)
    }

    pub fn from_stream<S>(name: impl Into<String>, events: S, indexer: Indexer<K>) -> Self
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    {
        Self { name: name.into(), events: events.boxed(), indexer }
    }

    /// Consume events until `shutdown` fires. Watch errors are logged; the watcher
    /// retries them with backoff.
    pub async fn run<F>(self, mut sink: F, shutdown: CancellationToken)
    where
        F: FnMut(InformerEvent) + Send,
    {
        let Informer { name, mut events, indexer } = self;
        info!(informer = %name, "informer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        for ev in apply_event(&indexer, event) {
                            sink(ev);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(informer = %name, error = %e, "watch error; retrying with backoff");
                        metrics::counter!("informer_watch_errors_total", 1u64, "informer" => name.clone());
                    }
                    None => {
                        warn!(informer = %name, "watch stream ended");
                        break;
                    }
                }
            }
        }
        info!(informer = %name, "informer stopped");
    }
}

fn key_of<K: Resource>(obj: &K) -> Option<WatchKey> {
    match WatchKey::from_meta(obj.meta()) {
        Ok(k) => Some(k),
        Err(e) => {
            warn!(error = %e, "ignoring object without a usable key");
            None
        }
    }
}

/// Apply one watcher event to `indexer` and return the resulting notifications.
///
/// A relist (`Restarted`) is diffed against the cache: new keys are creates, keys whose
/// resourceVersion moved are updates, and keys that vanished are deletes.
pub fn apply_event<K: Resource + Clone>(indexer: &Indexer<K>, event: watcher::Event<K>) -> Vec<InformerEvent> {
    match event {
        watcher::Event::Applied(obj) => {
            let Some(key) = key_of(&obj) else { return Vec::new() };
            let kind = if indexer.upsert(key.clone(), obj).is_some() { EventType::Update } else { EventType::Create };
            vec![InformerEvent::new(key, kind)]
        }
        watcher::Event::Deleted(obj) => {
            let Some(key) = key_of(&obj) else { return Vec::new() };
            indexer.remove(&key);
            vec![InformerEvent::new(key, EventType::Delete)]
        }
        watcher::Event::Restarted(objs) => {
            let fresh: Vec<(WatchKey, K)> = objs.into_iter().filter_map(|o| key_of(&o).map(|k| (k, o))).collect();
            let versions: Vec<(WatchKey, Option<String>)> =
                fresh.iter().map(|(k, o)| (k.clone(), o.meta().resource_version.clone())).collect();
            let prev = indexer.replace(fresh);
            let mut seen = FxHashSet::default();
            let mut out = Vec::new();
            for (key, rv) in versions {
                match prev.get(&key) {
                    None => out.push(InformerEvent::new(key.clone(), EventType::Create)),
                    Some(old) if old.meta().resource_version != rv => out.push(InformerEvent::new(key.clone(), EventType::Update)),
                    Some(_) => {}
                }
                seen.insert(key);
            }
            let mut gone: Vec<&WatchKey> = prev.keys().filter(|k| !seen.contains(*k)).collect();
            gone.sort();
            out.extend(gone.into_iter().map(|k| InformerEvent::new(k.clone(), EventType::Delete)));
            debug!(items = seen.len(), events = out.len(), "relist applied");
            out
        }
    }
}
