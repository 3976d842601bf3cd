//! Beacon aggregate views.
//!
//! Derived state is never patched incrementally: every recomputation re-lists the
//! relevant kinds directly from the API server (not from informer caches) and builds
//! the whole view in one pass, so a published view is always internally consistent.
//!
//! - [`FluxStateAggregator`]: Flux sources, Kustomizations, HelmReleases and Terraform
//!   objects decoded into [`FluxResource`] variants.
//! - [`TopologyAggregator`]: Services with the Pods, Deployments and Ingresses they front.

#![forbid(unsafe_code)]

mod error;
mod kinds;
mod published;
pub mod resources;
mod state;
pub mod topology;

pub use error::AggregateError;
pub use kinds::FluxKind;
pub use published::Published;
pub use resources::FluxResource;
pub use state::{ConversionPolicy, DynamicLister, FluxState, FluxStateAggregator, KubeLister};
pub use topology::{KubeTopologySource, ServiceEntry, ServiceTopology, TopologyAggregator, TopologySource};
