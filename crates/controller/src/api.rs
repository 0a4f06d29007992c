//! HTTP API for health checks, Prometheus metrics, and controller status.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use controller_lib::control_loop::ControllerState;
use controller_lib::health::ComponentStatus;
use controller_lib::{ControllerMetrics, HealthRegistry};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::ControllerConfig;

/// Shared application state read by every handler. Never written from
/// here: the control loop task owns all mutation.
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
    pub controller_state: Arc<ControllerState>,
    pub config: Arc<ControllerConfig>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: ControllerMetrics,
        controller_state: Arc<ControllerState>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            controller_state,
            config,
        }
    }
}

/// Liveness probe: a static OK, independent of component health. Distinct
/// from `/healthz` below, which reports per-component status.
async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

#[derive(Debug, Serialize)]
struct StatusConfig {
    poll_interval: u64,
    sla_threshold_ms: f64,
    min_weight: u32,
    max_weight: u32,
    cooldown: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node: String,
    hp_count: usize,
    lp_count: usize,
    hp_weight: u32,
    lp_weight: u32,
    last_update_unix: Option<i64>,
    last_error: Option<String>,
    config: StatusConfig,
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.controller_state.snapshot().await;
    Json(StatusResponse {
        node: state.config.node_name.clone(),
        hp_count: snapshot.hp_count,
        lp_count: snapshot.lp_count,
        hp_weight: snapshot.setpoint.hp_weight,
        lp_weight: snapshot.setpoint.lp_weight,
        last_update_unix: snapshot.last_applied_unix,
        last_error: snapshot.last_error,
        config: StatusConfig {
            poll_interval: state.config.control_loop_interval,
            sla_threshold_ms: state.config.sla_threshold_ms,
            min_weight: state.config.min_io_weight,
            max_weight: state.config.max_io_weight,
            cooldown: state.config.adjustment_cooldown,
        },
    })
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting telemetry server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
