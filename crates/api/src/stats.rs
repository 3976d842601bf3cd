use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use beacon_core::{Envelope, EventTag};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ClientHub;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TagTraffic {
    pub count: u64,
    pub bytes: u64,
}

/// Payload of the periodic `STATS` envelope. Counters are cumulative since start.
/// `envelopes` counts fan-outs; `bytes` is what was written to sockets after
/// projection, summed over connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub connections: usize,
    pub envelopes: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub by_type: BTreeMap<&'static str, TagTraffic>,
}

#[derive(Default)]
struct Counters {
    envelopes: u64,
    bytes: u64,
    dropped: u64,
    by_type: BTreeMap<&'static str, TagTraffic>,
}

/// Traffic counters shared by the hub run loop and the connection writers.
#[derive(Default)]
pub struct TrafficStats {
    inner: Mutex<Counters>,
}

impl TrafficStats {
    fn lock(&self) -> MutexGuard<'_, Counters> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn record_envelope(&self, tag: EventTag) {
        let mut c = self.lock();
        c.envelopes += 1;
        c.by_type.entry(tag.as_str()).or_default().count += 1;
    }

    /// Bytes of one frame as written to one connection.
    pub fn record_sent(&self, tag: EventTag, bytes: usize) {
        let bytes = bytes as u64;
        let mut c = self.lock();
        c.bytes += bytes;
        c.by_type.entry(tag.as_str()).or_default().bytes += bytes;
    }

    pub fn record_dropped(&self, n: usize) { self.lock().dropped += n as u64; }

    pub fn report(&self, connections: usize) -> StatsReport {
        let c = self.lock();
        StatsReport { connections, envelopes: c.envelopes, bytes: c.bytes, dropped: c.dropped, by_type: c.by_type.clone() }
    }
}

/// Broadcast a `STATS` envelope every `every` until `shutdown` fires.
pub async fn run_stats_ticker(hub: Arc<ClientHub>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = hub.report();
                debug!(connections = report.connections, envelopes = report.envelopes, "stats tick");
                match Envelope::new(EventTag::Stats, &report) {
                    Ok(env) => hub.broadcast(env),
                    Err(e) => warn!(error = %e, "encoding stats"),
                }
            }
        }
    }
}
