//! Adaptive I/O weight controller
//!
//! Runs as a DaemonSet on each Kubernetes node, watching HP pod tail
//! latency and steering cgroup v2 I/O priority between HP and LP pods.

use anyhow::{Context, Result};
use controller_lib::blockdev::BlockDeviceResolver;
use controller_lib::cgroup::{parse_bandwidth_value, CgroupDriver};
use controller_lib::cluster::ClusterView;
use controller_lib::control_loop::{ControlLoop, ControlLoopConfig, ControllerState, PolicyConfig};
use controller_lib::health::components;
use controller_lib::latency::PrometheusLatencySource;
use controller_lib::{HealthRegistry, StructuredLogger};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run() -> Result<()> {
    let cfg = config::ControllerConfig::load().context("failed to load controller configuration")?;
    info!(node_name = %cfg.node_name, mode = %cfg.mode, "controller configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::CLUSTER_VIEW).await;
    health_registry.register(components::LATENCY_SOURCE).await;
    health_registry.register(components::CGROUP_DRIVER).await;
    health_registry.register(components::CONTROL_LOOP).await;

    let metrics = controller_lib::ControllerMetrics::new();
    let logger = StructuredLogger::new(&cfg.node_name);
    logger.log_startup(CONTROLLER_VERSION, &cfg.mode);

    let kube_client = build_kube_client(cfg.cluster_api_url.as_deref())
        .await
        .context("failed to build Kubernetes client")?;

    let namespace = if cfg.namespace == "all" {
        None
    } else {
        Some(cfg.namespace.clone())
    };
    let cluster_view = ClusterView::new(
        kube_client,
        cfg.node_name.clone(),
        namespace,
        cfg.priority_label_key.clone(),
        cfg.priority_hp_value.clone(),
        cfg.priority_lp_value.clone(),
    );

    let latency_source = PrometheusLatencySource::new(
        cfg.timeseries_url.clone(),
        &cfg.namespace,
        &cfg.priority_hp_value,
    )
    .context("failed to build Prometheus latency source")?;

    let cgroup_driver = Arc::new(CgroupDriver::new(cfg.cgroup_root.clone()));

    let policy = build_policy(&cfg).await?;
    let control_loop_config = ControlLoopConfig {
        tick_interval: Duration::from_secs(cfg.control_loop_interval),
        adjustment_cooldown: Duration::from_secs(cfg.adjustment_cooldown),
        sla_threshold_ms: cfg.sla_threshold_ms,
        min_weight: cfg.min_io_weight,
        max_weight: cfg.max_io_weight,
        policy,
    };

    let controller_state = ControllerState::new();
    let control_loop = ControlLoop::new(
        cluster_view,
        latency_source,
        cgroup_driver,
        controller_state.clone(),
        metrics.clone(),
        logger.clone(),
        control_loop_config,
    );

    let cfg = Arc::new(cfg);
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        controller_state,
        cfg.clone(),
    ));

    health_registry.set_ready(true).await;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let api_handle = tokio::spawn(api::serve(cfg.metrics_port, app_state));
    let loop_shutdown_rx = shutdown_tx.subscribe();
    let loop_handle = tokio::spawn(control_loop.run(loop_shutdown_rx));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            logger.log_shutdown("SIGINT received");
        }
        res = terminate_signal() => {
            res?;
            logger.log_shutdown("SIGTERM received");
        }
    }

    let _ = shutdown_tx.send(());
    api_handle.abort();
    let _ = loop_handle.await;

    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> Result<()> {
    std::future::pending().await
}

async fn build_kube_client(cluster_api_url: Option<&str>) -> Result<kube::Client> {
    let mut kube_config = kube::Config::infer()
        .await
        .context("failed to infer Kubernetes config (in-cluster or kubeconfig)")?;

    if let Some(url) = cluster_api_url {
        kube_config.cluster_url = url.parse().context("invalid CLUSTER_API_URL")?;
    }

    kube::Client::try_from(kube_config).context("failed to construct Kubernetes client")
}

async fn build_policy(cfg: &config::ControllerConfig) -> Result<PolicyConfig> {
    if cfg.mode != "bandwidth" {
        return Ok(PolicyConfig::Weight);
    }

    let mount_path = cfg
        .shared_mount_path
        .as_deref()
        .context("MODE=bandwidth requires SHARED_MOUNT_PATH")?;

    let resolver = BlockDeviceResolver::new();
    let device = resolver
        .resolve(mount_path)
        .await
        .with_context(|| format!("failed to resolve block device for {mount_path}"))?;

    let base_read_bps = match &cfg.read_bandwidth_limit {
        Some(v) => parse_bandwidth_value(v).map_err(anyhow::Error::msg)?,
        None => None,
    };
    let base_write_bps = match &cfg.write_bandwidth_limit {
        Some(v) => parse_bandwidth_value(v).map_err(anyhow::Error::msg)?,
        None => None,
    };

    info!(
        device = %device,
        mount_path,
        "bandwidth mode configured"
    );

    Ok(PolicyConfig::Bandwidth {
        device,
        base_read_bps,
        base_write_bps,
    })
}

