use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::stream::{ws_handler, StreamQuery};
use crate::{ApiError, ClientHub, ClusterSnapshot, SnapshotSource};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ClientHub>,
    pub snapshot: Arc<dyn SnapshotSource>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/state", get(state_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn state_handler(State(state): State<AppState>, Query(query): Query<StreamQuery>) -> Result<Json<ClusterSnapshot>, ApiError> {
    let snapshot = state.snapshot.snapshot().await.map_err(ApiError::Snapshot)?;
    Ok(Json(snapshot.project(&query.selection())))
}

async fn healthz() -> &'static str { "ok" }

/// Serve until the state's shutdown token fires.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), ApiError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| ApiError::Bind { addr, source })?;
    info!(%addr, "http listening");
    let token = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(ApiError::Serve)
}
