use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use beacon_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("serving http: {0}")]
    Serve(#[source] std::io::Error),
    #[error("socket write: {0}")]
    Write(String),
    #[error("socket write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("encoding frame: {0}")]
    Encode(#[from] CoreError),
    #[error("building snapshot: {0}")]
    Snapshot(#[source] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response { (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response() }
}
