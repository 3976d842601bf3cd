use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};

pub const SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";
pub const KUSTOMIZE_GROUP: &str = "kustomize.toolkit.fluxcd.io";
pub const HELM_GROUP: &str = "helm.toolkit.fluxcd.io";
pub const TERRAFORM_GROUP: &str = "infra.contrib.fluxcd.io";

/// Custom resource kinds that feed the Flux state view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FluxKind {
    GitRepository,
    OciRepository,
    Bucket,
    HelmRepository,
    Kustomization,
    HelmRelease,
    Terraform,
}

impl FluxKind {
    pub const ALL: [FluxKind; 7] = [
        FluxKind::GitRepository,
        FluxKind::OciRepository,
        FluxKind::Bucket,
        FluxKind::HelmRepository,
        FluxKind::Kustomization,
        FluxKind::HelmRelease,
        FluxKind::Terraform,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            FluxKind::GitRepository => "GitRepository",
            FluxKind::OciRepository => "OCIRepository",
            FluxKind::Bucket => "Bucket",
            FluxKind::HelmRepository => "HelmRepository",
            FluxKind::Kustomization => "Kustomization",
            FluxKind::HelmRelease => "HelmRelease",
            FluxKind::Terraform => "Terraform",
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            FluxKind::GitRepository | FluxKind::OciRepository | FluxKind::Bucket | FluxKind::HelmRepository => SOURCE_GROUP,
            FluxKind::Kustomization => KUSTOMIZE_GROUP,
            FluxKind::HelmRelease => HELM_GROUP,
            FluxKind::Terraform => TERRAFORM_GROUP,
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            FluxKind::GitRepository => "gitrepositories",
            FluxKind::OciRepository => "ocirepositories",
            FluxKind::Bucket => "buckets",
            FluxKind::HelmRepository => "helmrepositories",
            FluxKind::Kustomization => "kustomizations",
            FluxKind::HelmRelease => "helmreleases",
            FluxKind::Terraform => "terraforms",
        }
    }

    /// Served versions to probe, most preferred first.
    pub fn candidate_versions(&self) -> &'static [&'static str] {
        match self {
            FluxKind::GitRepository | FluxKind::OciRepository | FluxKind::Bucket | FluxKind::HelmRepository => &["v1", "v1beta2"],
            FluxKind::Kustomization => &["v1", "v1beta2"],
            FluxKind::HelmRelease => &["v2", "v2beta2", "v2beta1"],
            FluxKind::Terraform => &["v1alpha2", "v1alpha1"],
        }
    }

    /// Core Flux kinds are assumed installed; the rest degrade gracefully when absent.
    pub fn required(&self) -> bool { matches!(self, FluxKind::GitRepository | FluxKind::Kustomization) }

    pub fn api_resource(&self, version: &str) -> ApiResource {
        let gvk = GroupVersionKind::gvk(self.group(), version, self.kind());
        ApiResource::from_gvk_with_plural(&gvk, self.plural())
    }

    pub fn from_kind(kind: &str) -> Option<FluxKind> { FluxKind::ALL.into_iter().find(|k| k.kind() == kind) }
}

impl std::fmt::Display for FluxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.kind()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_carries_group_version_plural() {
        let ar = FluxKind::HelmRelease.api_resource("v2beta2");
        assert_eq!(ar.group, HELM_GROUP);
        assert_eq!(ar.version, "v2beta2");
        assert_eq!(ar.api_version, "helm.toolkit.fluxcd.io/v2beta2");
        assert_eq!(ar.plural, "helmreleases");
        assert_eq!(ar.kind, "HelmRelease");
    }

    #[test]
    fn only_core_kinds_are_required() {
        let required: Vec<_> = FluxKind::ALL.into_iter().filter(FluxKind::required).collect();
        assert_eq!(required, vec![FluxKind::GitRepository, FluxKind::Kustomization]);
        assert_eq!(FluxKind::from_kind("OCIRepository"), Some(FluxKind::OciRepository));
    }
}
