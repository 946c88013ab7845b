//! `GET /health`: whether the relay can verify deliveries and hand them on.
//!
//! The secret store is pinged, since every signed delivery needs it. A
//! closed event channel means accepted deliveries would all be refused
//! with 503. Either condition reports `degraded` with a 503 status.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use tracing::warn;

use super::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `ok` or `degraded`.
    pub status: &'static str,
    /// `ok` or `unavailable`.
    pub store: &'static str,
    /// `ok`, `closed`, or `none` when no consumer is configured.
    pub consumer: &'static str,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

pub async fn health_report(app_state: &AppState) -> HealthReport {
    let secrets = app_state.secrets().clone();
    let store = match tokio::task::spawn_blocking(move || secrets.ping()).await {
        Ok(Ok(())) => "ok",
        Ok(Err(e)) => {
            warn!(error = %e, "Secret store health check failed");
            "unavailable"
        }
        Err(e) => {
            warn!(error = %e, "Secret store health check panicked");
            "unavailable"
        }
    };
    let consumer = match app_state.events() {
        None => "none",
        Some(tx) if tx.is_closed() => "closed",
        Some(_) => "ok",
    };
    let status = if store == "ok" && consumer != "closed" {
        "ok"
    } else {
        "degraded"
    };
    HealthReport {
        status,
        store,
        consumer,
    }
}

pub async fn health_handler(
    State(app_state): State<AppState>,
) -> (StatusCode, Json<HealthReport>) {
    let report = health_report(&app_state).await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
