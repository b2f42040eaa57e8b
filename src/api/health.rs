/// Health check and metrics endpoints
///
/// Liveness only proves the process answers. Readiness and the detailed
/// report also probe the KV store and report queue depths.

use crate::{context::AppContext, error::AppResult, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy"
    pub status: String,

    pub version: String,

    pub checks: Vec<ComponentHealth>,
}

/// Health status of individual component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,

    /// Status: "healthy", "disabled" or "unhealthy"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(metrics_handler))
}

/// Status, version, media queue depth and push enablement
pub async fn health(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "media_queue_depth": ctx.media_queue.len(),
        "push_enabled": ctx.push.is_enabled(),
    }))
}

pub async fn liveness_probe() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready when the KV store answers
pub async fn readiness_probe(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let mut checks = vec![check_store(&ctx).await];
    checks.push(check_media_queue(&ctx));
    checks.push(check_push(&ctx));

    let healthy = checks.iter().all(|c| c.status != "unhealthy");
    let status = if healthy { "healthy" } else { "unhealthy" };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthStatus {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks,
        }),
    )
}

/// Probe the store with a read transaction
pub async fn probe_store(ctx: &AppContext) -> AppResult<()> {
    ctx.store.view_blocking(|_tx| Ok(())).await
}

async fn check_store(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    let result = probe_store(ctx).await;
    let elapsed = start.elapsed().as_millis() as u64;

    match result {
        Ok(()) => ComponentHealth {
            name: "kv_store".to_string(),
            status: "healthy".to_string(),
            response_time_ms: Some(elapsed),
            error: None,
            details: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "KV store health check failed");
            ComponentHealth {
                name: "kv_store".to_string(),
                status: "unhealthy".to_string(),
                response_time_ms: Some(elapsed),
                error: Some(e.to_string()),
                details: None,
            }
        }
    }
}

fn check_media_queue(ctx: &AppContext) -> ComponentHealth {
    ComponentHealth {
        name: "media_queue".to_string(),
        status: "healthy".to_string(),
        response_time_ms: None,
        error: None,
        details: Some(serde_json::json!({
            "depth": ctx.media_queue.len(),
            "capacity": ctx.media_queue.capacity(),
        })),
    }
}

fn check_push(ctx: &AppContext) -> ComponentHealth {
    let status = if ctx.push.is_enabled() {
        "healthy"
    } else {
        "disabled"
    };
    ComponentHealth {
        name: "push".to_string(),
        status: status.to_string(),
        response_time_ms: None,
        error: None,
        details: Some(serde_json::json!({ "depth": ctx.push.len() })),
    }
}

/// Prometheus exposition
async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}
