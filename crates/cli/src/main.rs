use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_aggregate::ConversionPolicy;
use beacon_api::{run_stats_ticker, AppState, ClientHub, HubConfig, SnapshotSource};
use beacon_core::EnvelopeSink;
use beacon_kubehub::{kube_client, ClientOptions, ClusterWatch, ControllerConfig, WatchSettings};
use clap::{ArgAction, Parser};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "beacond", version, about = "Stream live cluster and Flux state to dashboard clients")]
struct Config {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "BEACON_LISTEN", default_value = "0.0.0.0:9000")]
    listen: SocketAddr,
    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "BEACON_NAMESPACE")]
    namespace: Option<String>,
    /// Worker tasks per controller
    #[arg(long, env = "BEACON_WORKERS", default_value_t = 1)]
    workers: usize,
    /// Reaction attempts per key before it is dropped
    #[arg(long, env = "BEACON_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,
    #[arg(long, env = "BEACON_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,
    #[arg(long, env = "BEACON_BACKOFF_MAX_MS", default_value_t = 60_000)]
    backoff_max_ms: u64,
    /// Frames buffered per client before it is disconnected as slow
    #[arg(long, env = "BEACON_CLIENT_QUEUE", default_value_t = 256)]
    client_queue: usize,
    #[arg(long, env = "BEACON_WRITE_TIMEOUT_MS", default_value_t = 10_000)]
    write_timeout_ms: u64,
    #[arg(long, env = "BEACON_STATS_INTERVAL_SECS", default_value_t = 30)]
    stats_interval_secs: u64,
    /// Skip Flux objects that fail to decode instead of failing the whole state
    #[arg(long, env = "BEACON_SKIP_INVALID", action = ArgAction::SetTrue)]
    skip_invalid: bool,
    #[arg(long, env = "BEACON_IMPERSONATE_USER")]
    impersonate_user: Option<String>,
    #[arg(long = "impersonate-group", env = "BEACON_IMPERSONATE_GROUPS", value_delimiter = ',')]
    impersonate_groups: Vec<String>,
    /// Prometheus exporter address (host:port); off when unset
    #[arg(long, env = "BEACON_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

impl Config {
    fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            namespace: self.namespace.clone(),
            controller: ControllerConfig {
                threadiness: self.workers.max(1),
                max_attempts: self.max_attempts.max(1),
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_millis(self.backoff_max_ms),
            },
            conversion: if self.skip_invalid { ConversionPolicy::SkipInvalid } else { ConversionPolicy::FailFast },
        }
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig { client_queue: self.client_queue.max(1), write_timeout: Duration::from_millis(self.write_timeout_ms) }
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions { impersonate_user: self.impersonate_user.clone(), impersonate_groups: self.impersonate_groups.clone() }
    }
}

fn init_tracing() {
    let env = std::env::var("BEACON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid BEACON_METRICS_ADDR; expected host:port"),
    }
}

async fn shutdown_on_signal(token: CancellationToken) {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "listening for ctrl-c");
    }
    info!("shutdown requested");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = Config::parse();
    init_metrics(cfg.metrics_addr.as_deref());

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let hub = ClientHub::new(cfg.hub_config());
    let hub_task = tokio::spawn(Arc::clone(&hub).run(shutdown.clone()));
    let stats_task = tokio::spawn(run_stats_ticker(Arc::clone(&hub), Duration::from_secs(cfg.stats_interval_secs.max(1)), shutdown.clone()));

    let client = kube_client(&cfg.client_options()).await?;
    let sink: Arc<dyn EnvelopeSink> = hub.clone();
    let watch = ClusterWatch::start(client, cfg.watch_settings(), sink, shutdown.clone()).await.context("starting controllers")?;
    let snapshot: Arc<dyn SnapshotSource> = watch.view.clone();

    let state = AppState { hub: Arc::clone(&hub), snapshot, shutdown: shutdown.clone() };
    let served = beacon_api::serve(cfg.listen, state).await;
    if let Err(e) = &served {
        error!(error = %e, "http server failed");
    }
    shutdown.cancel();

    watch.join().await;
    await_task("stats", stats_task).await;
    await_task("hub", hub_task).await;
    info!("beacond stopped");
    served.map_err(Into::into)
}

/// Wait for a background task; a panic or cancellation is logged. Returns whether it
/// finished cleanly.
async fn await_task(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = name, error = %e, "task failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicked_task_is_reported_not_propagated() {
        let ok = tokio::spawn(async {});
        let boom = tokio::spawn(async { panic!("boom") });
        assert!(await_task("ok", ok).await);
        assert!(!await_task("boom", boom).await);
    }
}
