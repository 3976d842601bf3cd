//! Fan-out of envelopes to every registered connection.
//!
//! Producers submit through an unbounded input channel and never wait on clients. The
//! run loop serializes each envelope once and offers it to every connection's bounded
//! queue with `try_send`; a connection whose queue is full or closed is deregistered
//! on the spot so it cannot hold back the others.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use beacon_core::{Envelope, EnvelopeSink, EventTag};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stats::{StatsReport, TrafficStats};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per connection before it counts as slow.
    pub client_queue: usize,
    /// Upper bound for a single socket write.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self { Self { client_queue: 256, write_timeout: Duration::from_secs(10) } }
}

/// One serialized envelope, shared by every connection.
#[derive(Debug)]
pub struct Frame {
    pub envelope: Envelope,
    pub json: String,
}

impl Frame {
    pub fn encode(envelope: Envelope) -> Result<Self, beacon_core::CoreError> {
        let json = envelope.to_json()?;
        Ok(Self { envelope, json })
    }

    pub fn tag(&self) -> EventTag { self.envelope.tag }
}

/// A registered connection's receiving end.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Arc<Frame>>,
}

pub struct ClientHub {
    config: HubConfig,
    conns: Mutex<FxHashMap<Uuid, mpsc::Sender<Arc<Frame>>>>,
    input: mpsc::UnboundedSender<Envelope>,
    input_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    stats: Arc<TrafficStats>,
}

impl ClientHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let (input, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            conns: Mutex::new(FxHashMap::default()),
            input,
            input_rx: Mutex::new(Some(rx)),
            stats: Arc::default(),
        })
    }

    fn conns(&self) -> MutexGuard<'_, FxHashMap<Uuid, mpsc::Sender<Arc<Frame>>>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &HubConfig { &self.config }
    pub fn connections(&self) -> usize { self.conns().len() }
    pub fn report(&self) -> StatsReport { self.stats.report(self.connections()) }
    pub fn stats(&self) -> Arc<TrafficStats> { Arc::clone(&self.stats) }

    pub fn register(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.client_queue.max(1));
        let id = Uuid::new_v4();
        let n = {
            let mut conns = self.conns();
            conns.insert(id, tx);
            conns.len()
        };
        gauge!("hub_connections", n as f64);
        info!(conn = %id, connections = n, "client registered");
        Subscription { id, rx }
    }

    /// Returns false if `id` was already gone.
    pub fn unregister(&self, id: Uuid) -> bool {
        let (removed, n) = {
            let mut conns = self.conns();
            let removed = conns.remove(&id).is_some();
            (removed, conns.len())
        };
        if removed {
            gauge!("hub_connections", n as f64);
            info!(conn = %id, connections = n, "client unregistered");
        }
        removed
    }

    /// Queue `envelope` for fan-out. Never blocks.
    pub fn broadcast(&self, envelope: Envelope) {
        if self.input.send(envelope).is_err() {
            debug!("hub input closed; envelope dropped");
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> { self.input.clone() }

    /// Offer one envelope to every connection. Returns how many accepted it.
    pub fn fan_out(&self, envelope: Envelope) -> usize {
        let frame = match Frame::encode(envelope) {
            Ok(f) => Arc::new(f),
            Err(e) => {
                warn!(error = %e, "skipping envelope that does not serialize");
                return 0;
            }
        };
        self.stats.record_envelope(frame.tag());
        counter!("hub_envelopes_total", 1u64, "type" => frame.tag().as_str());

        let mut stale = Vec::new();
        let mut delivered = 0;
        {
            let conns = self.conns();
            for (id, tx) in conns.iter() {
                match tx.try_send(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(conn = %id, "client queue full; disconnecting slow consumer");
                        stale.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => stale.push(*id),
                }
            }
        }
        if !stale.is_empty() {
            let dropped = stale.iter().filter(|id| self.unregister(**id)).count();
            self.stats.record_dropped(dropped);
            counter!("hub_dropped_connections_total", dropped as u64);
        }
        delivered
    }

    /// Drain the input channel until `shutdown` fires, then release every connection.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let taken = self.input_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut rx) = taken else {
            warn!("hub run loop already started");
            return;
        };
        info!(client_queue = self.config.client_queue, "hub started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => { self.fan_out(envelope); }
                    None => break,
                }
            }
        }
        let n = {
            let mut conns = self.conns();
            let n = conns.len();
            conns.clear();
            n
        };
        info!(released = n, "hub stopped");
    }
}

impl EnvelopeSink for ClientHub {
    fn publish(&self, envelope: Envelope) { self.broadcast(envelope) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(n: u64) -> Envelope { Envelope::from_value(EventTag::PodUpdated, json!({ "n": n })) }

    #[test]
    fn register_and_unregister_track_connections() {
        let hub = ClientHub::new(HubConfig::default());
        let a = hub.register();
        let b = hub.register();
        assert_ne!(a.id, b.id);
        assert_eq!(hub.connections(), 2);
        assert!(hub.unregister(a.id));
        assert!(!hub.unregister(a.id));
        assert_eq!(hub.connections(), 1);
    }

    #[test]
    fn full_queue_deregisters_only_that_connection() {
        let hub = ClientHub::new(HubConfig { client_queue: 2, ..Default::default() });
        let slow = hub.register();
        let mut fast = hub.register();
        for n in 0..2 {
            assert_eq!(hub.fan_out(env(n)), 2);
            fast.rx.try_recv().unwrap();
        }
        // slow never drained: third frame overflows it
        assert_eq!(hub.fan_out(env(2)), 1);
        assert_eq!(hub.connections(), 1);
        assert_eq!(fast.rx.try_recv().unwrap().envelope.payload["n"], 2);
        assert_eq!(hub.report().dropped, 1);
        drop(slow);
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let hub = ClientHub::new(HubConfig::default());
        let gone = hub.register();
        drop(gone.rx);
        assert_eq!(hub.fan_out(env(0)), 0);
        assert_eq!(hub.connections(), 0);
    }
}
