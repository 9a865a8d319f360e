//! HTTP surface for Warden: event ingress, health, and the admin policy API.

use axum::http::StatusCode;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use gatehouse_common::{GroupId, GroupPolicy, PolicyPatch, RestrictionRecord, UserId, WardenError};

use crate::state::AppState;

mod events;
mod health;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/metrics", get(health::metrics))

        // Platform events (neutral schema, adapter-facing)
        .route("/events", post(events::ingest))

        // Admin endpoints (policy management, gated per group)
        .nest("/admin", admin_routes())

        .layer(TraceLayer::new_for_http())

        // Add shared state
        .with_state(state)
}

/// Admin routes (per-group policy and audit history)
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/groups/{group_id}/policy",
            get(get_policy).put(update_policy),
        )
        .route("/groups/{group_id}/restrictions", get(list_restrictions))
}

fn error_status(err: &WardenError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

// === Admin Handlers ===

#[derive(Deserialize)]
struct ActorQuery {
    /// The user asking; every mutation and read here is admin-gated.
    actor_user_id: i64,
}

async fn get_policy(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Query(actor): Query<ActorQuery>,
) -> Result<Json<GroupPolicy>, StatusCode> {
    let group = GroupId(group_id);
    state
        .admins
        .require_admin(group, UserId(actor.actor_user_id))
        .await
        .map_err(|e| error_status(&e))?;

    let policy = state.policies.get(group).await.map_err(|e| error_status(&e))?;
    Ok(Json(policy))
}

#[derive(Deserialize)]
struct UpdatePolicyBody {
    actor_user_id: i64,
    #[serde(flatten)]
    patch: PolicyPatch,
}

async fn update_policy(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Json(body): Json<UpdatePolicyBody>,
) -> Result<Json<GroupPolicy>, StatusCode> {
    let group = GroupId(group_id);
    state
        .admins
        .require_admin(group, UserId(body.actor_user_id))
        .await
        .map_err(|e| error_status(&e))?;

    let policy = state
        .policies
        .upsert(group, body.patch)
        .await
        .map_err(|e| error_status(&e))?;
    Ok(Json(policy))
}

async fn list_restrictions(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Query(actor): Query<ActorQuery>,
) -> Result<Json<Vec<RestrictionRecord>>, StatusCode> {
    let group = GroupId(group_id);
    state
        .admins
        .require_admin(group, UserId(actor.actor_user_id))
        .await
        .map_err(|e| error_status(&e))?;

    let records = state
        .store
        .restrictions_for(group)
        .await
        .map_err(|e| error_status(&e))?;
    Ok(Json(records))
}
