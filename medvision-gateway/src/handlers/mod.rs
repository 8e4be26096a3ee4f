//! HTTP handlers for medvision-gateway.
//!
//! Every route answers with the `{ "success": ..., ... }` envelope; failures
//! go through `service_core::error::AppError`.

pub mod meldrx;
pub mod mock_meldrx;
pub mod streaming;
pub mod triage;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::services::get_metrics;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "medvision-gateway",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Prometheus metrics endpoint.
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
