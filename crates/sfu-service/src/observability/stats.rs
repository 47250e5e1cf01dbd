//! Operator stats endpoint.
//!
//! `GET /stats` returns the worker pool snapshot and the global resource
//! counts as JSON. Served on the health port next to `/metrics`.

use crate::registry::SessionStats;
use crate::session::SessionManager;
use crate::workers::{PoolStats, WorkerPool};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
struct StatsState {
    pool: Arc<WorkerPool>,
    sessions: Arc<SessionManager>,
}

/// Body of `GET /stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub sessions: SessionStats,
}

/// Router serving `GET /stats`.
pub fn stats_router(pool: Arc<WorkerPool>, sessions: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .with_state(StatsState { pool, sessions })
}

async fn stats_handler(
    State(state): State<StatsState>,
) -> Result<Json<ServiceStats>, StatusCode> {
    let sessions = state.sessions.stats(None).await.map_err(|e| {
        warn!(target: "sfu.stats", error = %e, "Failed to read session stats");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(ServiceStats {
        pool: state.pool.stats().await,
        sessions,
    }))
}
