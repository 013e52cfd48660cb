#![forbid(unsafe_code)]

mod config;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use keeper_agent::{run, AgentContext, AgentSettings};
use keeper_kubehub::{cluster_id, KubeApi, KubeClient};
use keeper_outbound::{Collector, HttpCollector, Messenger, RetryPolicy};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{filter_directive, resolve, KeeperConfig};

const STARTUP_RETRIES: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "watch-keeper", version, about = "Reports labelled Kubernetes resources to a Razee collector")]
struct Cli {
    /// Directory holding mounted config and secret files
    #[arg(long = "envs-dir", env = "KEEPER_ENVS_DIR", default_value = "envs")]
    envs_dir: PathBuf,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// File touched every tick, for liveness probes
    #[arg(long = "liveness-file", env = "LIVENESS_FILE")]
    liveness_file: Option<PathBuf>,

    /// Page size for list calls
    #[arg(long = "page-size", env = "PAGE_SIZE", default_value_t = 500)]
    page_size: u32,
}

fn init_tracing(level: Option<&str>) {
    let directive = filter_directive(level);
    let filter = tracing_subscriber::EnvFilter::try_new(&directive).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// Kubernetes client and cluster id, retried with a growing delay.
async fn connect(cfg: &KeeperConfig) -> Result<(Arc<dyn KubeApi>, String)> {
    let mut attempt = 0;
    loop {
        let result = async {
            let client = KubeClient::try_default().await?;
            let id = cluster_id(&client, cfg.cluster_id_override.as_deref(), &cfg.config_namespace)
                .await
                .context("fetching cluster id")?;
            Ok::<_, anyhow::Error>((Arc::new(client) as Arc<dyn KubeApi>, id))
        }
        .await;
        match result {
            Ok(ok) => return Ok(ok),
            Err(e) if attempt < STARTUP_RETRIES => {
                attempt += 1;
                let delay = Duration::from_secs(u64::from(attempt) * 2);
                warn!(attempt, delay_secs = delay.as_secs(), error = %format!("{:#}", e), "startup failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let resolved = resolve(&cli.envs_dir, |k| std::env::var(k).ok());
    init_tracing(resolved.as_ref().ok().and_then(|c| c.log_level.as_deref()));
    let cfg = resolved.inspect_err(|e| error!(error = %format!("{:#}", e), "invalid configuration"))?;
    init_metrics(cli.metrics_addr);

    info!(collector = %cfg.collector_url, namespace = %cfg.config_namespace, "starting watch-keeper");
    let collector: Arc<dyn Collector> = Arc::new(HttpCollector::new(&cfg.collector_url, cfg.org_key.clone())?);

    let (kube, id) = match connect(&cfg).await {
        Ok(ok) => ok,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Error fetching clusterID on startup.");
            let messenger = Messenger::new(collector, None, RetryPolicy::default());
            if let Err(send) = messenger.error("Error fetching clusterID on startup.", json!({"error": format!("{:#}", e)})).await {
                warn!(error = %send, "could not report startup failure");
            }
            return Err(e);
        }
    };
    info!(cluster_id = %id, "cluster identified");

    let mut settings = AgentSettings { page_size: cli.page_size, liveness_file: cli.liveness_file, ..AgentSettings::default() };
    cfg.apply(&mut settings);
    let ctx = AgentContext::new(kube, collector, &id, settings);
    run(&ctx, shutdown_signal()).await;
    info!("watch-keeper stopped");
    Ok(())
}
