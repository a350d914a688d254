use axum::extract::{Extension, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use common_http_errors::ErrorKind;
use serde::Serialize;
use serde_json::json;
use sysinfo::System;
use tracing::warn;

use crate::app_state::AppState;
use crate::context::RequestContext;

const OPENAPI_DOCUMENT: &str = include_str!("../docs/openapi.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// GET /health — aggregate of the KV store, every model, and system metrics.
/// Overall status is unhealthy iff any model or the KV store is unhealthy,
/// else degraded if any component is degraded.
pub async fn health(State(state): State<AppState>) -> Response {
    let kv_status = match state.kv.get("gateway:health:probe").await {
        Ok(_) => ComponentStatus::Healthy,
        Err(err) => {
            warn!(?err, "KV store health probe failed");
            ComponentStatus::Unhealthy
        }
    };

    let snapshots = state.health.snapshot();
    let mut models = serde_json::Map::new();
    let mut any_model_unhealthy = false;
    for (model_id, snapshot) in &snapshots {
        if !snapshot.healthy {
            any_model_unhealthy = true;
        }
        let circuit = state.upstream.circuit_state(model_id);
        models.insert(
            model_id.clone(),
            json!({
                "status": if snapshot.healthy { "healthy" } else { "unhealthy" },
                "last_check": snapshot.last_check,
                "avg_latency_ms": snapshot.avg_latency_ms,
                "circuit": circuit,
            }),
        );
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory().max(1);
    let heap_used_pct = (sys.used_memory() as f64 / total as f64) * 100.0;
    let system_status = if heap_used_pct > state.config.observability.heap_warn_pct {
        ComponentStatus::Degraded
    } else {
        ComponentStatus::Healthy
    };

    let overall = if kv_status == ComponentStatus::Unhealthy || any_model_unhealthy {
        ComponentStatus::Unhealthy
    } else if system_status == ComponentStatus::Degraded {
        ComponentStatus::Degraded
    } else {
        ComponentStatus::Healthy
    };

    let body = json!({
        "status": overall,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime().as_secs(),
        "components": {
            "kv": {"status": kv_status},
            "models": models,
            "system": {
                "status": system_status,
                "heap_used_pct": heap_used_pct,
            },
        },
    });

    let status = if overall == ComponentStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

/// GET /ready — ready iff the KV store answers and at least one model probe
/// is currently healthy.
pub async fn ready(State(state): State<AppState>) -> Response {
    let kv_ok = state.kv.get("gateway:health:probe").await.is_ok();
    let model_ok = state.health.any_healthy();
    let ready = kv_ok && model_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready }))).into_response()
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

/// GET /openapi.json — the static API document.
pub async fn openapi() -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        OPENAPI_DOCUMENT,
    )
        .into_response()
}

/// GET /docs — minimal HTML shell over the OpenAPI document.
pub async fn docs() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Autogram Gateway API</title>
  <meta charset="utf-8"/>
</head>
<body>
  <h1>Autogram Gateway API</h1>
  <p>The machine-readable API description is served at
     <a href="/openapi.json">/openapi.json</a>.</p>
</body>
</html>"#,
    )
}

/// Router fallback: unmatched routes get the standard envelope.
pub async fn not_found(Extension(ctx): Extension<RequestContext>) -> Response {
    ctx.record_error_kind("not-found");
    ctx.err(ErrorKind::NotFound)
        .with_message("no such endpoint")
        .into_response()
}
