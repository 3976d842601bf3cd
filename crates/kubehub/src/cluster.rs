//! Wires every controller against one cluster and exposes the resulting caches.

use std::sync::Arc;

use beacon_aggregate::{
    AggregateError, ConversionPolicy, FluxKind, FluxState, FluxStateAggregator, KubeLister, KubeTopologySource, ServiceTopology,
    TopologyAggregator,
};
use beacon_core::EnvelopeSink;
use beacon_store::Indexer;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    Client,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reactions::{broadcast_and_refresh, AggregateBroadcast, Broadcastable, LiveView, ObjectBroadcast};
use crate::{resolve_kinds, Controller, ControllerConfig, Informer, ListProbe, Reaction};

#[derive(Debug, Clone, Default)]
pub struct WatchSettings {
    /// Restrict every watch and list to one namespace.
    pub namespace: Option<String>,
    pub controller: ControllerConfig,
    pub conversion: ConversionPolicy,
}

/// Informer caches of the typed controllers plus the last published aggregate views.
pub struct ClusterView {
    pub pods: Indexer<Pod>,
    pub services: Indexer<Service>,
    pub deployments: Indexer<Deployment>,
    pub ingresses: Indexer<Ingress>,
    pub events: Indexer<Event>,
    pub flux: Arc<LiveView<FluxStateAggregator>>,
    pub topology: Arc<LiveView<TopologyAggregator>>,
}

impl ClusterView {
    /// The Flux state last broadcast, computed on demand if nothing was published yet.
    pub async fn flux_state(&self) -> Result<Arc<FluxState>, AggregateError> {
        self.flux.current_or_compute().await
    }

    pub async fn service_topology(&self) -> Result<Arc<ServiceTopology>, AggregateError> {
        self.topology.current_or_compute().await
    }

    /// Compute and broadcast both aggregate views once.
    pub async fn prime(&self, sink: &dyn EnvelopeSink) {
        if let Err(e) = self.flux.refresh(sink).await {
            warn!(error = %e, "initial flux state failed");
        }
        if let Err(e) = self.topology.refresh(sink).await {
            warn!(error = %e, "initial service topology failed");
        }
    }
}

/// Running controllers for one cluster.
pub struct ClusterWatch {
    pub view: Arc<ClusterView>,
    tasks: JoinSet<()>,
}

fn typed_api<K: Broadcastable>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn dynamic_api(client: &Client, namespace: Option<&str>, ar: &ApiResource) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}

struct Spawner<'a> {
    client: &'a Client,
    settings: &'a WatchSettings,
    shutdown: &'a CancellationToken,
    tasks: JoinSet<()>,
}

impl Spawner<'_> {
    fn typed<K: Broadcastable>(&mut self, reaction: Arc<dyn Reaction<K>>) -> Indexer<K> {
        let ctrl = Arc::new(Controller::new(K::NAME, reaction, self.settings.controller.clone()));
        let informer = Informer::new(K::NAME, typed_api::<K>(self.client, self.settings.namespace.as_deref()), ctrl.indexer());
        let indexer = ctrl.indexer();
        self.tasks.spawn(ctrl.run(informer, self.shutdown.clone()));
        indexer
    }

    fn broadcast<K: Broadcastable>(&mut self, sink: &Arc<dyn EnvelopeSink>) -> Indexer<K> {
        self.typed(Arc::new(ObjectBroadcast::<K>::new(Arc::clone(sink))))
    }

    fn flux(&mut self, kind: FluxKind, ar: &ApiResource, reaction: Arc<dyn Reaction<DynamicObject>>) {
        let ctrl = Arc::new(Controller::new(kind.plural(), reaction, self.settings.controller.clone()));
        let api = dynamic_api(self.client, self.settings.namespace.as_deref(), ar);
        let informer = Informer::new(kind.plural(), api, ctrl.indexer());
        self.tasks.spawn(ctrl.run(informer, self.shutdown.clone()));
    }
}

impl ClusterWatch {
    /// Resolve Flux versions, start every controller and prime the aggregate views.
    pub async fn start(
        client: Client,
        settings: WatchSettings,
        sink: Arc<dyn EnvelopeSink>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let namespace = settings.namespace.clone();
        let probe = ListProbe::new(client.clone(), namespace.clone());
        let kinds = resolve_kinds(&probe, &FluxKind::ALL).await?;

        let flux = Arc::new(LiveView::new(Arc::new(FluxStateAggregator::new(
            Arc::new(KubeLister::new(client.clone(), namespace.clone())),
            kinds.clone(),
            settings.conversion,
        ))));
        let topology = Arc::new(LiveView::new(Arc::new(TopologyAggregator::new(Arc::new(KubeTopologySource::new(
            client.clone(),
            namespace.clone(),
        ))))));

        // Every kind the topology is assembled from also refreshes it.
        let mut spawner = Spawner { client: &client, settings: &settings, shutdown: &shutdown, tasks: JoinSet::new() };
        let pods = spawner.typed::<Pod>(broadcast_and_refresh(&sink, &topology));
        let services = spawner.typed::<Service>(broadcast_and_refresh(&sink, &topology));
        let deployments = spawner.typed::<Deployment>(broadcast_and_refresh(&sink, &topology));
        let ingresses = spawner.typed::<Ingress>(broadcast_and_refresh(&sink, &topology));
        let events = spawner.broadcast::<Event>(&sink);

        let flux_reaction: Arc<dyn Reaction<DynamicObject>> = Arc::new(AggregateBroadcast::new(Arc::clone(&flux), Arc::clone(&sink)));
        for (kind, ar) in &kinds {
            spawner.flux(*kind, ar, Arc::clone(&flux_reaction));
        }
        let tasks = spawner.tasks;
        info!(controllers = tasks.len(), flux_kinds = kinds.len(), namespace = ?namespace, "cluster watch started");

        let view = Arc::new(ClusterView { pods, services, deployments, ingresses, events, flux, topology });
        view.prime(&*sink).await;
        Ok(Self { view, tasks })
    }

    /// Wait for every controller to stop.
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "controller task failed");
            }
        }
    }
}
