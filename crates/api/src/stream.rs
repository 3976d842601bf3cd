//! `GET /ws`: register, send the initial snapshot, then forward live deltas.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use beacon_core::{CoreError, Envelope, EventTag, FieldSelection};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::Frame;
use crate::stats::TrafficStats;
use crate::{ApiError, AppState, SnapshotSource};

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// JSON array or comma-separated dot paths.
    pub fields: Option<String>,
}

impl StreamQuery {
    pub fn selection(&self) -> FieldSelection { self.fields.as_deref().map(FieldSelection::parse).unwrap_or_default() }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, Query(query): Query<StreamQuery>) -> Response {
    let selection = query.selection();
    ws.on_upgrade(move |socket| serve_socket(socket, state, selection))
}

/// Wire text for `frame` as seen by a connection with `selection`. Only single-object
/// payloads are projected; deletes and aggregate views pass through.
pub fn render(frame: &Frame, selection: &FieldSelection) -> Result<String, CoreError> {
    if selection.is_empty() || !frame.tag().carries_object() {
        return Ok(frame.json.clone());
    }
    Envelope::from_value(frame.tag(), selection.shape(&frame.envelope.payload)).to_json()
}

pub async fn snapshot_text(source: &dyn SnapshotSource, selection: &FieldSelection) -> Result<String, ApiError> {
    let snapshot = source.snapshot().await.map_err(ApiError::Snapshot)?.project(selection);
    Ok(Envelope::new(EventTag::StateReceived, &snapshot)?.to_json()?)
}

async fn send_text<S>(sink: &mut S, text: String, write_timeout: Duration) -> Result<(), ApiError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(write_timeout, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ApiError::Write(e.to_string())),
        Err(_) => Err(ApiError::WriteTimeout(write_timeout)),
    }
}

/// Connection writer: forward frames until the hub releases the connection or a write
/// fails or times out. Bytes are counted as written, after projection.
pub async fn pump<S>(
    mut rx: mpsc::Receiver<Arc<Frame>>,
    mut sink: S,
    selection: FieldSelection,
    write_timeout: Duration,
    stats: Arc<TrafficStats>,
) -> Result<(), ApiError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = rx.recv().await {
        let text = match render(&frame, &selection) {
            Ok(t) => t,
            Err(e) => {
                warn!(tag = frame.tag().as_str(), error = %e, "skipping frame");
                continue;
            }
        };
        let bytes = text.len();
        send_text(&mut sink, text, write_timeout).await?;
        stats.record_sent(frame.tag(), bytes);
        metrics::counter!("ws_bytes_sent_total", bytes as u64);
    }
    Ok(())
}

async fn serve_socket(socket: WebSocket, state: AppState, selection: FieldSelection) {
    let sub = state.hub.register();
    let id = sub.id;
    let write_timeout = state.hub.config().write_timeout;
    let (mut sink, mut incoming) = socket.split();

    let stats = state.hub.stats();
    let snapshot = match snapshot_text(&*state.snapshot, &selection).await {
        Ok(text) => {
            let bytes = text.len();
            send_text(&mut sink, text, write_timeout).await.map(|()| stats.record_sent(EventTag::StateReceived, bytes))
        }
        Err(e) => Err(e),
    };
    if let Err(e) = snapshot {
        warn!(conn = %id, error = %e, "initial snapshot failed; closing");
        state.hub.unregister(id);
        return;
    }
    debug!(conn = %id, fields = selection.paths().len(), "snapshot sent");

    let reader = async {
        while let Some(msg) = incoming.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    tokio::select! {
        res = pump(sub.rx, sink, selection, write_timeout, stats) => finish(id, res),
        _ = reader => debug!(conn = %id, "client closed"),
        _ = state.shutdown.cancelled() => debug!(conn = %id, "closing for shutdown"),
    }
    state.hub.unregister(id);
}

fn finish(id: Uuid, res: Result<(), ApiError>) {
    match res {
        Ok(()) => info!(conn = %id, "released by hub"),
        Err(e) => warn!(conn = %id, error = %e, "write failed; disconnecting"),
    }
}
