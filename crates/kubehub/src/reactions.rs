//! Reactions that turn controller changes into broadcast envelopes.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use beacon_aggregate::{AggregateError, FluxState, FluxStateAggregator, Published, ServiceTopology, TopologyAggregator};
use beacon_core::{strip_managed_fields, CoreError, Envelope, EnvelopeSink, EventTag, ResourceTags};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{Change, Reaction};

/// A typed kind broadcast object-by-object.
pub trait Broadcastable:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
    const TAGS: ResourceTags;
    /// Controller and informer name.
    const NAME: &'static str;
}

impl Broadcastable for Pod {
    const TAGS: ResourceTags = ResourceTags::POD;
    const NAME: &'static str = "pods";
}

impl Broadcastable for Service {
    const TAGS: ResourceTags = ResourceTags::SERVICE;
    const NAME: &'static str = "services";
}

impl Broadcastable for Deployment {
    const TAGS: ResourceTags = ResourceTags::DEPLOYMENT;
    const NAME: &'static str = "deployments";
}

impl Broadcastable for Ingress {
    const TAGS: ResourceTags = ResourceTags::INGRESS;
    const NAME: &'static str = "ingresses";
}

impl Broadcastable for Event {
    const TAGS: ResourceTags = ResourceTags::EVENT;
    const NAME: &'static str = "events";
}

/// Envelope for a single-object change: the object without managedFields, or the key
/// string for deletes.
pub fn object_envelope<K: Serialize>(tags: ResourceTags, change: &Change<K>) -> Result<Envelope, CoreError> {
    match change {
        Change::Created(obj) | Change::Updated(obj) => {
            let mut value = serde_json::to_value(&**obj)?;
            strip_managed_fields(&mut value);
            Ok(Envelope::from_value(tags.for_event(change.event_type()), value))
        }
        Change::Deleted(key) => Ok(Envelope::deleted(tags.deleted, key)),
    }
}

pub struct ObjectBroadcast<K> {
    sink: Arc<dyn EnvelopeSink>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> ObjectBroadcast<K> {
    pub fn new(sink: Arc<dyn EnvelopeSink>) -> Self { Self { sink, _kind: PhantomData } }
}

#[async_trait]
impl<K: Broadcastable> Reaction<K> for ObjectBroadcast<K> {
    async fn react(&self, change: Change<K>) -> anyhow::Result<()> {
        match object_envelope(K::TAGS, &change) {
            Ok(env) => self.sink.publish(env),
            // Retrying cannot fix a payload that does not serialize.
            Err(e) => {
                warn!(kind = K::NAME, error = %e, "skipping unserializable object");
                metrics::counter!("broadcast_skipped_total", 1u64, "kind" => K::NAME);
            }
        }
        Ok(())
    }
}

/// A derived view rebuilt from scratch on every triggering change.
#[async_trait]
pub trait Recompute: Send + Sync + 'static {
    type Output: Serialize + PartialEq + Send + Sync + 'static;
    const TAG: EventTag;
    async fn recompute(&self) -> Result<Self::Output, AggregateError>;
}

#[async_trait]
impl Recompute for FluxStateAggregator {
    type Output = FluxState;
    const TAG: EventTag = EventTag::FluxStateReceived;
    async fn recompute(&self) -> Result<FluxState, AggregateError> { self.compute().await }
}

#[async_trait]
impl Recompute for TopologyAggregator {
    type Output = ServiceTopology;
    const TAG: EventTag = EventTag::ServicesReceived;
    async fn recompute(&self) -> Result<ServiceTopology, AggregateError> { self.compute().await }
}

/// Store `next` and broadcast it unless it equals the last published value.
/// Returns whether an envelope went out.
fn publish_view<T: Serialize + PartialEq>(sink: &dyn EnvelopeSink, published: &Published<T>, tag: EventTag, next: T) -> bool {
    if !published.publish_if_changed(next) {
        debug!(tag = tag.as_str(), "view unchanged; not broadcasting");
        return false;
    }
    let Some(current) = published.current() else { return false };
    match Envelope::new(tag, &*current) {
        Ok(env) => {
            sink.publish(env);
            true
        }
        Err(e) => {
            warn!(tag = tag.as_str(), error = %e, "skipping unserializable view");
            false
        }
    }
}

/// An aggregate view and its last published value.
///
/// Passes are serialized: a recomputation and its publish run under one lock, so a
/// pass that listed earlier can never replace the value of a pass that listed later.
pub struct LiveView<A: Recompute> {
    aggregator: Arc<A>,
    published: Published<A::Output>,
    pass: Mutex<()>,
}

impl<A: Recompute> LiveView<A> {
    pub fn new(aggregator: Arc<A>) -> Self { Self { aggregator, published: Published::default(), pass: Mutex::new(()) } }

    pub fn current(&self) -> Option<Arc<A::Output>> { self.published.current() }

    /// Recompute from the API and broadcast the result if it changed.
    /// Returns whether an envelope went out.
    pub async fn refresh(&self, sink: &dyn EnvelopeSink) -> Result<bool, AggregateError> {
        let _pass = self.pass.lock().await;
        let next = self.aggregator.recompute().await?;
        Ok(publish_view(sink, &self.published, A::TAG, next))
    }

    /// The view last broadcast, computed on demand if nothing was published yet.
    pub async fn current_or_compute(&self) -> Result<Arc<A::Output>, AggregateError> {
        match self.current() {
            Some(view) => Ok(view),
            None => Ok(Arc::new(self.aggregator.recompute().await?)),
        }
    }
}

/// Refreshes a [`LiveView`] on any change of the watched kind. Listing or conversion
/// failures are returned so the key is retried.
pub struct AggregateBroadcast<A: Recompute> {
    view: Arc<LiveView<A>>,
    sink: Arc<dyn EnvelopeSink>,
}

impl<A: Recompute> AggregateBroadcast<A> {
    pub fn new(view: Arc<LiveView<A>>, sink: Arc<dyn EnvelopeSink>) -> Self { Self { view, sink } }
}

#[async_trait]
impl<A, K> Reaction<K> for AggregateBroadcast<A>
where
    A: Recompute,
    K: Send + Sync + 'static,
{
    async fn react(&self, change: Change<K>) -> anyhow::Result<()> {
        let sent = self.view.refresh(&*self.sink).await.with_context(|| format!("recomputing {}", A::TAG.as_str()))?;
        debug!(tag = A::TAG.as_str(), trigger = ?change.event_type(), sent, "view recomputed");
        Ok(())
    }
}

/// Hands each change to several reactions in order. Every reaction runs even if an
/// earlier one failed; the first error is returned.
pub struct FanOut<K> {
    reactions: Vec<Arc<dyn Reaction<K>>>,
}

impl<K> FanOut<K> {
    pub fn new(reactions: Vec<Arc<dyn Reaction<K>>>) -> Self { Self { reactions } }
}

#[async_trait]
impl<K: Clone + Send + Sync + 'static> Reaction<K> for FanOut<K> {
    async fn react(&self, change: Change<K>) -> anyhow::Result<()> {
        let mut first = None;
        for reaction in &self.reactions {
            if let Err(e) = reaction.react(change.clone()).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Broadcast each object change, then refresh `view` from the API.
pub fn broadcast_and_refresh<K: Broadcastable, A: Recompute>(sink: &Arc<dyn EnvelopeSink>, view: &Arc<LiveView<A>>) -> Arc<dyn Reaction<K>> {
    let reactions: Vec<Arc<dyn Reaction<K>>> = vec![
        Arc::new(ObjectBroadcast::<K>::new(Arc::clone(sink))),
        Arc::new(AggregateBroadcast::new(Arc::clone(view), Arc::clone(sink))),
    ];
    Arc::new(FanOut::new(reactions))
}
