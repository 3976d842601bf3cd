use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("object metadata has no name")]
    MissingName,
    #[error("invalid watch key: {0:?} (expect name or namespace/name)")]
    InvalidKey(String),
    #[error("serializing envelope payload: {0}")]
    Serialize(#[from] serde_json::Error),
}
