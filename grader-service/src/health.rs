//! Liveness, readiness and stats endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use grader_job_queue::JobQueue;
use grader_workers::{PoolStats, WorkerPool};

#[derive(Clone)]
pub struct HealthState {
    pub pool: Arc<WorkerPool>,
    pub queue: JobQueue,
}

#[derive(Debug, Serialize)]
struct StatsBody {
    topic: String,
    queue_stopped: bool,
    in_flight: usize,
    pool: PoolStats,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(|| async { (StatusCode::OK, "OK") }))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn ready(State(state): State<HealthState>) -> impl IntoResponse {
    if state.pool.is_running() && !state.queue.is_stopped() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn stats(State(state): State<HealthState>) -> Json<StatsBody> {
    Json(StatsBody {
        topic: state.queue.topic().to_string(),
        queue_stopped: state.queue.is_stopped(),
        in_flight: state.queue.in_flight(),
        pool: state.pool.stats(),
    })
}
