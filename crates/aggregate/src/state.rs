use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::resources::{Bucket, GitRepository, HelmRelease, HelmRepository, Kustomization, OciRepository, Terraform};
use crate::{AggregateError, FluxKind, FluxResource};

/// Lists custom resources straight from the API server.
#[async_trait]
pub trait DynamicLister: Send + Sync {
    async fn list(&self, resource: &ApiResource) -> anyhow::Result<Vec<DynamicObject>>;
}

pub struct KubeLister {
    client: Client,
    namespace: Option<String>,
}

impl KubeLister {
    pub fn new(client: Client, namespace: Option<String>) -> Self { Self { client, namespace } }
}

#[async_trait]
impl DynamicLister for KubeLister {
    async fn list(&self, resource: &ApiResource) -> anyhow::Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = match self.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// What to do with an object that does not decode into its typed form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversionPolicy {
    /// The whole pass fails.
    #[default]
    FailFast,
    /// Skip the object and record a warning in [`FluxState::warnings`].
    SkipInvalid,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxState {
    pub git_repositories: Vec<GitRepository>,
    pub oci_repositories: Vec<OciRepository>,
    pub buckets: Vec<Bucket>,
    pub helm_repositories: Vec<HelmRepository>,
    pub kustomizations: Vec<Kustomization>,
    pub helm_releases: Vec<HelmRelease>,
    pub tf_resources: Vec<Terraform>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl FluxState {
    pub fn push(&mut self, res: FluxResource) {
        match res {
            FluxResource::GitRepository(o) => self.git_repositories.push(o),
            FluxResource::OciRepository(o) => self.oci_repositories.push(o),
            FluxResource::Bucket(o) => self.buckets.push(o),
            FluxResource::HelmRepository(o) => self.helm_repositories.push(o),
            FluxResource::Kustomization(o) => self.kustomizations.push(o),
            FluxResource::HelmRelease(o) => self.helm_releases.push(o),
            FluxResource::Terraform(o) => self.tf_resources.push(o),
        }
    }

    pub fn len(&self) -> usize {
        self.git_repositories.len()
            + self.oci_repositories.len()
            + self.buckets.len()
            + self.helm_repositories.len()
            + self.kustomizations.len()
            + self.helm_releases.len()
            + self.tf_resources.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Recomputes [`FluxState`] from a fresh listing of every resolved Flux kind.
pub struct FluxStateAggregator {
    lister: Arc<dyn DynamicLister>,
    kinds: Vec<(FluxKind, ApiResource)>,
    policy: ConversionPolicy,
}

impl FluxStateAggregator {
    pub fn new(lister: Arc<dyn DynamicLister>, kinds: Vec<(FluxKind, ApiResource)>, policy: ConversionPolicy) -> Self {
        Self { lister, kinds, policy }
    }

    pub async fn compute(&self) -> Result<FluxState, AggregateError> {
        let started = Instant::now();
        let mut state = FluxState::default();
        for (kind, ar) in &self.kinds {
            let mut items = self
                .lister
                .list(ar)
                .await
                .map_err(|source| AggregateError::List { kind: kind.to_string(), source })?;
            items.sort_by(|a, b| {
                (a.metadata.namespace.as_deref(), a.metadata.name.as_deref()).cmp(&(b.metadata.namespace.as_deref(), b.metadata.name.as_deref()))
            });
            for obj in &items {
                match FluxResource::decode(*kind, obj) {
                    Ok(res) => state.push(res),
                    Err(e) => match self.policy {
                        ConversionPolicy::FailFast => return Err(e),
                        ConversionPolicy::SkipInvalid => {
                            warn!(error = %e, "skipping malformed flux object");
                            state.warnings.push(e.to_string());
                        }
                    },
                }
            }
        }
        histogram!("aggregate_flux_state_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(objects = state.len(), warnings = state.warnings.len(), "flux state computed");
        Ok(state)
    }
}
