//! Pick the served API version of each Flux kind by probing candidates in preference order.

use async_trait::async_trait;
use beacon_aggregate::FluxKind;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tracing::{debug, info, warn};

use crate::SetupError;

#[async_trait]
pub trait VersionProbe: Send + Sync {
    /// Ok when the API server serves `resource`.
    async fn probe(&self, resource: &ApiResource) -> anyhow::Result<()>;
}

/// Probes with a single-item list.
pub struct ListProbe {
    client: Client,
    namespace: Option<String>,
}

impl ListProbe {
    pub fn new(client: Client, namespace: Option<String>) -> Self { Self { client, namespace } }
}

#[async_trait]
impl VersionProbe for ListProbe {
    async fn probe(&self, resource: &ApiResource) -> anyhow::Result<()> {
        let api: Api<DynamicObject> = match self.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        };
        api.list(&ListParams::default().limit(1)).await?;
        Ok(())
    }
}

/// First candidate version of `kind` the probe accepts.
pub async fn negotiate(probe: &dyn VersionProbe, kind: FluxKind) -> Option<ApiResource> {
    for version in kind.candidate_versions() {
        let ar = kind.api_resource(version);
        match probe.probe(&ar).await {
            Ok(()) => return Some(ar),
            Err(e) => debug!(%kind, version, error = %e, "version not served"),
        }
    }
    None
}

/// Resolve every kind in `kinds`. A missing required kind is fatal; missing optional
/// kinds are left out.
pub async fn resolve_kinds(probe: &dyn VersionProbe, kinds: &[FluxKind]) -> Result<Vec<(FluxKind, ApiResource)>, SetupError> {
    let mut out = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        match negotiate(probe, kind).await {
            Some(ar) => {
                info!(%kind, api_version = %ar.api_version, "resolved");
                out.push((kind, ar));
            }
            None if kind.required() => {
                return Err(SetupError::MissingKind { kind, tried: kind.candidate_versions().join(", ") });
            }
            None => warn!(%kind, "not served by the cluster; skipping"),
        }
    }
    Ok(out)
}
