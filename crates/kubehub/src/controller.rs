//! Generic watch controller: informer events are coalesced per key on a work queue and
//! handed to a [`Reaction`] by a pool of workers, with bounded rate-limited retries.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use beacon_core::{EventType, InformerEvent, WatchKey};
use beacon_store::{Indexer, WorkQueue};
use chrono::{DateTime, Utc};
use kube::Resource;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Informer;

/// What a worker hands to the reaction for one dequeued key.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Created(Arc<K>),
    Updated(Arc<K>),
    Deleted(WatchKey),
}

impl<K> Change<K> {
    pub fn event_type(&self) -> EventType {
        match self {
            Change::Created(_) => EventType::Create,
            Change::Updated(_) => EventType::Update,
            Change::Deleted(_) => EventType::Delete,
        }
    }
}

/// Per-controller business logic. An `Err` schedules a retry of the key.
#[async_trait]
pub trait Reaction<K: Send + Sync + 'static>: Send + Sync {
    async fn react(&self, change: Change<K>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub threadiness: usize,
    /// Reaction invocations per key before it is dropped.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { threadiness: 1, max_attempts: 5, backoff_base: Duration::from_millis(5), backoff_max: Duration::from_secs(60) }
    }
}

pub struct Controller<K> {
    name: String,
    queue: Arc<WorkQueue<WatchKey>>,
    indexer: Indexer<K>,
    pending: Mutex<FxHashMap<WatchKey, EventType>>,
    reaction: Arc<dyn Reaction<K>>,
    started_at: DateTime<Utc>,
    config: ControllerConfig,
}

impl<K> Controller<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, reaction: Arc<dyn Reaction<K>>, config: ControllerConfig) -> Self {
        let name = name.into();
        Self {
            queue: WorkQueue::new(name.clone(), config.backoff_base, config.backoff_max),
            name,
            indexer: Indexer::new(),
            pending: Mutex::new(FxHashMap::default()),
            reaction,
            started_at: Utc::now(),
            config,
        }
    }

    /// Creates of objects older than `started_at` are not reacted to.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn indexer(&self) -> Indexer<K> { self.indexer.clone() }
    pub fn queue(&self) -> &Arc<WorkQueue<WatchKey>> { &self.queue }

    fn pending(&self) -> MutexGuard<'_, FxHashMap<WatchKey, EventType>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_pending(&self, key: &WatchKey, kind: EventType) {
        self.pending().entry(key.clone()).and_modify(|e| *e = e.merge(kind)).or_insert(kind);
    }

    /// Put back the kind of a failed attempt, ahead of anything that arrived meanwhile.
    fn restore_pending(&self, key: &WatchKey, kind: EventType) {
        let mut pending = self.pending();
        let merged = pending.get(key).map_or(kind, |later| kind.merge(*later));
        pending.insert(key.clone(), merged);
    }

    fn created_before_start(&self, key: &WatchKey) -> bool {
        self.indexer
            .get(key)
            .and_then(|obj| obj.meta().creation_timestamp.as_ref().map(|t| t.0 < self.started_at))
            .unwrap_or(false)
    }

    /// Informer callback. Startup creates are dropped; everything else is coalesced
    /// with whatever is already pending for the key.
    pub fn enqueue(&self, ev: InformerEvent) {
        if ev.event_type == EventType::Create && self.created_before_start(&ev.key) {
            trace!(controller = %self.name, key = %ev.key, "suppressing create of pre-existing object");
            counter!("controller_startup_suppressed_total", 1u64, "controller" => self.name.clone());
            return;
        }
        self.record_pending(&ev.key, ev.event_type);
        self.queue.add(ev.key);
    }

    fn change_for(&self, key: &WatchKey, kind: EventType) -> Change<K> {
        match (self.indexer.get(key), kind) {
            (None, _) => Change::Deleted(key.clone()),
            (Some(obj), EventType::Create) => Change::Created(obj),
            (Some(obj), _) => Change::Updated(obj),
        }
    }

    /// Process one key. Returns false once the queue has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else { return false };
        self.handle(&key).await;
        self.queue.done(&key);
        true
    }

    async fn handle(&self, key: &WatchKey) {
        let kind = self.pending().remove(key).unwrap_or(EventType::Update);
        let change = self.change_for(key, kind);
        let started = Instant::now();
        let res = self.reaction.react(change).await;
        histogram!("controller_reaction_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => self.name.clone());
        match res {
            Ok(()) => {
                self.queue.forget(key);
                debug!(controller = %self.name, key = %key, ?kind, "processed");
            }
            Err(e) => {
                let attempts = self.queue.num_requeues(key) + 1;
                if attempts < self.config.max_attempts {
                    warn!(controller = %self.name, key = %key, attempts, error = %e, "reaction failed; retrying");
                    counter!("controller_retries_total", 1u64, "controller" => self.name.clone());
                    self.restore_pending(key, kind);
                    self.queue.add_rate_limited(key.clone());
                } else {
                    self.queue.forget(key);
                    error!(controller = %self.name, key = %key, attempts, error = ?e, "dropping key after repeated failures");
                    counter!("controller_dropped_total", 1u64, "controller" => self.name.clone());
                }
            }
        }
    }

    /// Spawn `threadiness` workers draining the queue until it shuts down.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.threadiness.max(1))
            .map(|worker| {
                let ctrl = Arc::clone(self);
                tokio::spawn(async move {
                    while ctrl.process_next().await {}
                    debug!(controller = %ctrl.name, worker, "worker exiting");
                })
            })
            .collect()
    }

    /// Run `informer` and the workers until `shutdown` fires, then drain and stop.
    pub async fn run(self: Arc<Self>, informer: Informer<K>, shutdown: CancellationToken) {
        info!(controller = %self.name, threadiness = self.config.threadiness, "controller starting");
        let feed = {
            let ctrl = Arc::clone(&self);
            let token = shutdown.clone();
            tokio::spawn(async move { informer.run(move |ev| ctrl.enqueue(ev), token).await })
        };
        let workers = self.spawn_workers();
        shutdown.cancelled().await;
        self.queue.shut_down();
        for w in workers {
            if let Err(e) = w.await {
                warn!(controller = %self.name, error = %e, "worker task failed");
            }
        }
        if let Err(e) = feed.await {
            warn!(controller = %self.name, error = %e, "informer task failed");
        }
        info!(controller = %self.name, "controller stopped");
    }
}
