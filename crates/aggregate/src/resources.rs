//! Typed views of the Flux custom resources, decoded once at the API boundary.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::{AggregateError, FluxKind};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Status fields shared by the Flux controllers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

impl FluxStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> { self.conditions.iter().find(|c| c.type_ == type_) }

    /// `Ready=True`; `None` while the controller has not reported yet.
    pub fn ready(&self) -> Option<bool> { self.condition("Ready").map(|c| c.status == "True") }
}

/// Reference from a Kustomization/HelmRelease/Terraform to its source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    pub url: String,
    #[serde(default)]
    pub interval: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitReference>,
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciRepositorySpec {
    pub url: String,
    #[serde(default)]
    pub interval: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<OciReference>,
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    pub bucket_name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub interval: String,
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    pub url: String,
    #[serde(default)]
    pub interval: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub interval: String,
    pub source_ref: SourceRef,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartTemplateSpec {
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub source_ref: SourceRef,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartTemplate {
    pub spec: HelmChartTemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<HelmChartTemplate>,
    #[serde(default)]
    pub interval: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformSpec {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub interval: String,
    pub source_ref: SourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_plan: Option<String>,
    #[serde(default)]
    pub suspend: bool,
}

/// One Flux object: type metadata, object metadata, typed spec and the shared status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxObject<S> {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: FluxStatus,
}

pub type GitRepository = FluxObject<GitRepositorySpec>;
pub type OciRepository = FluxObject<OciRepositorySpec>;
pub type Bucket = FluxObject<BucketSpec>;
pub type HelmRepository = FluxObject<HelmRepositorySpec>;
pub type Kustomization = FluxObject<KustomizationSpec>;
pub type HelmRelease = FluxObject<HelmReleaseSpec>;
pub type Terraform = FluxObject<TerraformSpec>;

/// Decoded custom resource, one variant per supported kind.
#[derive(Debug, Clone, PartialEq)]
pub enum FluxResource {
    GitRepository(GitRepository),
    OciRepository(OciRepository),
    Bucket(Bucket),
    HelmRepository(HelmRepository),
    Kustomization(Kustomization),
    HelmRelease(HelmRelease),
    Terraform(Terraform),
}

impl FluxResource {
    pub fn decode(kind: FluxKind, obj: &DynamicObject) -> Result<FluxResource, AggregateError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let conv = |source: serde_json::Error| AggregateError::Convert { kind, name: name.clone(), source };
        let mut raw = serde_json::to_value(obj).map_err(conv)?;
        beacon_core::strip_managed_fields(&mut raw);
        let res = match kind {
            FluxKind::GitRepository => FluxResource::GitRepository(serde_json::from_value(raw).map_err(conv)?),
            FluxKind::OciRepository => FluxResource::OciRepository(serde_json::from_value(raw).map_err(conv)?),
            FluxKind::Bucket => FluxResource::Bucket(serde_json::from_value(raw).map_err(conv)?),
            FluxKind::HelmRepository => FluxResource::HelmRepository(serde_json::from_value(raw).map_err(conv)?),
            FluxKind::Kustomization => FluxResource::Kustomization(serde_json::from_value(raw).map_err(conv)?),
            FluxKind::HelmRelease => FluxResource::HelmRelease(serde_json::from_value(raw).map_err(conv)?),
            FluxKind::Terraform => FluxResource::Terraform(serde_json::from_value(raw).map_err(conv)?),
        };
        Ok(res)
    }
}
