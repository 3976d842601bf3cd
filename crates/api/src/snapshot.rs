//! Full-state payload sent to a connection right after it registers.

use async_trait::async_trait;
use beacon_core::{strip_managed_fields, FieldSelection};
use beacon_kubehub::ClusterView;
use beacon_store::Indexer;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub pods: Vec<Value>,
    pub services: Vec<Value>,
    pub deployments: Vec<Value>,
    pub ingresses: Vec<Value>,
    pub events: Vec<Value>,
    pub flux_state: Value,
    pub service_topology: Value,
}

impl ClusterSnapshot {
    /// Apply `selection` to every single-object entry; aggregate views stay intact.
    pub fn project(mut self, selection: &FieldSelection) -> Self {
        if selection.is_empty() {
            return self;
        }
        for list in [&mut self.pods, &mut self.services, &mut self.deployments, &mut self.ingresses, &mut self.events] {
            for obj in list.iter_mut() {
                *obj = selection.shape(obj);
            }
        }
        self
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<ClusterSnapshot>;
}

fn objects<K: Serialize>(indexer: &Indexer<K>) -> anyhow::Result<Vec<Value>> {
    indexer
        .list()
        .iter()
        .map(|obj| {
            let mut v = serde_json::to_value(&**obj)?;
            strip_managed_fields(&mut v);
            Ok::<_, anyhow::Error>(v)
        })
        .collect()
}

fn view_or_null<T: Serialize, E: std::fmt::Display>(what: &str, res: Result<std::sync::Arc<T>, E>) -> anyhow::Result<Value> {
    match res {
        Ok(view) => Ok(serde_json::to_value(&*view)?),
        Err(e) => {
            warn!(view = what, error = %e, "snapshot without aggregate view");
            Ok(Value::Null)
        }
    }
}

#[async_trait]
impl SnapshotSource for ClusterView {
    async fn snapshot(&self) -> anyhow::Result<ClusterSnapshot> {
        Ok(ClusterSnapshot {
            pods: objects(&self.pods)?,
            services: objects(&self.services)?,
            deployments: objects(&self.deployments)?,
            ingresses: objects(&self.ingresses)?,
            events: objects(&self.events)?,
            flux_state: view_or_null("fluxState", self.flux_state().await)?,
            service_topology: view_or_null("serviceTopology", self.service_topology().await)?,
        })
    }
}
