//! Service → Pod/Deployment/Ingress associations.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Instant;

use async_trait::async_trait;
use beacon_core::{labels_match_selectors, selectors_match};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    Client, Resource,
};
use metrics::histogram;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::AggregateError;

#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn services(&self) -> anyhow::Result<Vec<Service>>;
    async fn pods(&self) -> anyhow::Result<Vec<Pod>>;
    async fn deployments(&self) -> anyhow::Result<Vec<Deployment>>;
    async fn ingresses(&self) -> anyhow::Result<Vec<Ingress>>;
}

pub struct KubeTopologySource {
    client: Client,
    namespace: Option<String>,
}

impl KubeTopologySource {
    pub fn new(client: Client, namespace: Option<String>) -> Self { Self { client, namespace } }

    async fn list<K>(&self) -> anyhow::Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl TopologySource for KubeTopologySource {
    async fn services(&self) -> anyhow::Result<Vec<Service>> { self.list().await }
    async fn pods(&self) -> anyhow::Result<Vec<Pod>> { self.list().await }
    async fn deployments(&self) -> anyhow::Result<Vec<Deployment>> { self.list().await }
    async fn ingresses(&self) -> anyhow::Result<Vec<Ingress>> { self.list().await }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub svc: Service,
    pub pods: Vec<Pod>,
    pub deployments: Vec<Deployment>,
    pub ingresses: Vec<Ingress>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceTopology {
    pub services: Vec<ServiceEntry>,
}

fn stripped<K: Resource>(mut obj: K) -> K {
    obj.meta_mut().managed_fields = None;
    obj
}

fn same_namespace<A: Resource, B: Resource>(a: &A, b: &B) -> bool { a.meta().namespace == b.meta().namespace }

fn deployment_matches(dep: &Deployment, selector: &BTreeMap<String, String>) -> bool {
    let Some(spec) = dep.spec.as_ref() else { return false };
    if let Some(match_labels) = spec.selector.match_labels.as_ref() {
        if selectors_match(match_labels, selector) { return true; }
    }
    spec.template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.as_ref())
        .map(|labels| labels_match_selectors(labels, selector))
        .unwrap_or(false)
}

fn backend_names(backend: &IngressBackend, service: &str) -> bool {
    backend.service.as_ref().map(|s| s.name == service).unwrap_or(false)
}

fn ingress_targets(ing: &Ingress, service: &str) -> bool {
    let Some(spec) = ing.spec.as_ref() else { return false };
    if spec.default_backend.as_ref().map(|b| backend_names(b, service)).unwrap_or(false) {
        return true;
    }
    spec.rules.iter().flatten().filter_map(|r| r.http.as_ref()).flat_map(|h| h.paths.iter()).any(|p| backend_names(&p.backend, service))
}

/// Associate each Service with the objects it selects. Services without a selector
/// select no Pods or Deployments.
pub fn assemble(services: Vec<Service>, pods: Vec<Pod>, deployments: Vec<Deployment>, ingresses: Vec<Ingress>) -> ServiceTopology {
    let mut out = Vec::with_capacity(services.len());
    for svc in services {
        let svc = stripped(svc);
        let selector = svc.spec.as_ref().and_then(|s| s.selector.clone()).unwrap_or_default();
        let name = svc.metadata.name.clone().unwrap_or_default();
        let mut entry = ServiceEntry::default();
        if !selector.is_empty() {
            entry.pods = pods
                .iter()
                .filter(|p| same_namespace(*p, &svc))
                .filter(|p| p.metadata.labels.as_ref().map(|l| labels_match_selectors(l, &selector)).unwrap_or(false))
                .cloned()
                .map(stripped)
                .collect();
            entry.deployments = deployments
                .iter()
                .filter(|d| same_namespace(*d, &svc) && deployment_matches(d, &selector))
                .cloned()
                .map(stripped)
                .collect();
        }
        entry.ingresses = ingresses
            .iter()
            .filter(|i| same_namespace(*i, &svc) && ingress_targets(i, &name))
            .cloned()
            .map(stripped)
            .collect();
        entry.svc = svc;
        out.push(entry);
    }
    out.sort_by(|a, b| {
        (a.svc.metadata.namespace.as_deref(), a.svc.metadata.name.as_deref()).cmp(&(b.svc.metadata.namespace.as_deref(), b.svc.metadata.name.as_deref()))
    });
    ServiceTopology { services: out }
}

fn list_err(kind: &'static str) -> impl FnOnce(anyhow::Error) -> AggregateError {
    move |source| AggregateError::List { kind: kind.to_string(), source }
}

pub struct TopologyAggregator {
    source: std::sync::Arc<dyn TopologySource>,
}

impl TopologyAggregator {
    pub fn new(source: std::sync::Arc<dyn TopologySource>) -> Self { Self { source } }

    pub async fn compute(&self) -> Result<ServiceTopology, AggregateError> {
        let started = Instant::now();
        let services = self.source.services().await.map_err(list_err("Service"))?;
        let pods = self.source.pods().await.map_err(list_err("Pod"))?;
        let deployments = self.source.deployments().await.map_err(list_err("Deployment"))?;
        let ingresses = self.source.ingresses().await.map_err(list_err("Ingress"))?;
        let topology = assemble(services, pods, deployments, ingresses);
        histogram!("aggregate_topology_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(topology)
    }
}
