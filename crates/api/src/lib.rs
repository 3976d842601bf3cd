//! Beacon API: the broadcast hub and the HTTP/WebSocket surface browsers connect to.

#![forbid(unsafe_code)]

mod error;
pub mod hub;
mod server;
mod snapshot;
mod stats;
pub mod stream;

pub use error::ApiError;
pub use hub::{ClientHub, Frame, HubConfig, Subscription};
pub use server::{router, serve, AppState};
pub use snapshot::{ClusterSnapshot, SnapshotSource};
pub use stats::{run_stats_ticker, StatsReport, TagTraffic, TrafficStats};
