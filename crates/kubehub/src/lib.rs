//! Beacon kubehub: informers, the generic watch controller and the per-resource
//! controllers that feed the broadcast hub.

#![forbid(unsafe_code)]

mod cluster;
mod controller;
mod error;
mod informer;
mod negotiate;
pub mod reactions;

use anyhow::Context;
use kube::Client;
use tracing::info;

pub use cluster::{ClusterView, ClusterWatch, WatchSettings};
pub use controller::{Change, Controller, ControllerConfig, Reaction};
pub use error::SetupError;
pub use informer::{apply_event, Informer};
pub use negotiate::{negotiate, resolve_kinds, ListProbe, VersionProbe};

/// Identity the dashboard acts as against the API server.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub impersonate_user: Option<String>,
    pub impersonate_groups: Vec<String>,
}

/// Build a client from the ambient kubeconfig or in-cluster environment.
pub async fn kube_client(opts: &ClientOptions) -> Result<Client, SetupError> {
    let mut config = kube::Config::infer().await.context("inferring kube config").map_err(SetupError::Client)?;
    if let Some(user) = opts.impersonate_user.as_ref() {
        config.auth_info.impersonate = Some(user.clone());
        if !opts.impersonate_groups.is_empty() {
            config.auth_info.impersonate_groups = Some(opts.impersonate_groups.clone());
        }
        info!(user = %user, groups = ?opts.impersonate_groups, "impersonating");
    }
    Client::try_from(config).context("constructing client").map_err(SetupError::Client)
}
