//! Liveness. No authentication: the container orchestrator polls this.

use axum::{Json, Router, extract::State, routing::get};
use serde_json::json;

use crate::ApiService;

pub fn create_router() -> Router<ApiService> {
    Router::new().route("/health", get(liveness))
}

async fn liveness(State(ctx): State<ApiService>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "services": ctx.registry.list_services().await.len(),
        "workers": ctx.health.worker_count(),
    }))
}
