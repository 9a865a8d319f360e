//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    cache: bool,
    store: bool,
}

/// Readiness check (are all dependencies healthy?)
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    let (cache_ok, store_ok) = state.ready().await;

    if cache_ok && store_ok {
        Ok(Json(ReadyResponse {
            status: "ready",
            cache: true,
            store: true,
        }))
    } else {
        // Return 503 if not ready
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[derive(Serialize)]
pub struct MetricsResponse {
    open_requests: i64,
    restrictions_total: i64,
}

/// Metrics endpoint (for monitoring)
pub async fn metrics(State(state): State<AppState>) -> Result<Json<MetricsResponse>, StatusCode> {
    let counts = state
        .store
        .call(|conn| {
            let open_requests: i64 = conn.query_row(
                "SELECT COUNT(*) FROM membership_requests WHERE status IN ('pending', 'challenge_issued')",
                [],
                |row| row.get(0),
            )?;
            let restrictions_total: i64 =
                conn.query_row("SELECT COUNT(*) FROM restrictions", [], |row| row.get(0))?;
            Ok((open_requests, restrictions_total))
        })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(MetricsResponse {
        open_requests: counts.0,
        restrictions_total: counts.1,
    }))
}
