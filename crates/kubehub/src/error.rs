use beacon_aggregate::FluxKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{kind} is required but none of [{tried}] is served")]
    MissingKind { kind: FluxKind, tried: String },
    #[error("building kube client: {0}")]
    Client(#[source] anyhow::Error),
}
