use thiserror::Error;

use crate::FluxKind;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("listing {kind}: {source}")]
    List {
        kind: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("converting {kind} {name:?}: {source}")]
    Convert {
        kind: FluxKind,
        name: String,
        #[source]
        source: serde_json::Error,
    },
}
