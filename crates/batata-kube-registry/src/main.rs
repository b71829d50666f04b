//! Entry point for the Batata Kubernetes registry.
//!
//! Watches the cluster and mirrors it into the mesh model until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use batata_kube_registry::{
    Controller, ControllerOptions, logging, metrics::{self, MetricsEventCounter}, watch,
};
use batata_mesh::{PushBridge, PushStatus};
use clap::Parser;
use tokio::sync::watch as signal;
use tracing::{error, info};

/// Command line arguments for the registry
#[derive(Debug, Parser)]
#[command(version, about = "Mirror Kubernetes services into the Batata mesh model")]
struct Cli {
    /// YAML config file, defaults apply when omitted
    #[arg(short = 'c', long = "config", env = "BATATA_REGISTRY_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long = "log-level", env = "BATATA_REGISTRY_LOG_LEVEL")]
    log_level: Option<String>,
    #[arg(long = "cluster-id", env = "BATATA_REGISTRY_CLUSTER_ID")]
    cluster_id: Option<String>,
    /// Namespace to watch, all namespaces when empty
    #[arg(short = 'n', long = "namespace", env = "BATATA_REGISTRY_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut options = ControllerOptions::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        options.log_level = level;
    }
    if let Some(cluster_id) = cli.cluster_id {
        options.cluster_id = cluster_id;
    }
    if let Some(namespace) = cli.namespace {
        options.watched_namespace = namespace;
    }

    logging::init_logging(&options.log_level)?;
    metrics::init_metrics();

    info!(
        cluster = %options.cluster_id,
        namespace = %options.watched_namespace,
        domain_suffix = %options.domain_suffix,
        "Starting Batata Kubernetes registry"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let bridge = Arc::new(PushBridge::default());
    let (bridge_stop_tx, bridge_stop_rx) = signal::channel(false);
    let bridge_handle = bridge.start(bridge_stop_rx)?;

    let controller = Arc::new(
        Controller::new(options, bridge.clone())
            .with_status_reporter(Arc::new(PushStatus::new()))
            .with_event_counter(Arc::new(MetricsEventCounter)),
    );

    let worker = tokio::spawn(controller.clone().run());
    let watchers = tokio::spawn(watch::run_watchers(controller.clone(), client));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    controller.stop();
    for (name, handle) in [("worker", worker), ("watchers", watchers)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }

    bridge_stop_tx.send_replace(true);
    if let Err(e) = bridge_handle.await {
        error!(error = %e, "Push bridge ended abnormally");
    }

    let stats = bridge.snapshot().stats();
    info!(
        hostnames = stats.hostnames,
        endpoints = stats.endpoints,
        dropped_events = bridge.dropped_events(),
        "Batata Kubernetes registry stopped"
    );
    Ok(())
}
