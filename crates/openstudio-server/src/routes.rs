//! `GET /api/station` and `GET /health` — the two plain HTTP endpoints the
//! signaling router is merged with: a liveness/uptime probe, and the
//! station manifest served verbatim with permissive CORS.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

use openstudio_common::config::StationManifest;

#[derive(Clone)]
pub struct RouteState {
    pub manifest: Arc<StationManifest>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime: u64,
}

pub fn router(state: RouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/station",
            get(station).layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health(State(state): State<RouteState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
    })
}

async fn station(State(state): State<RouteState>) -> Json<StationManifest> {
    Json((*state.manifest).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes_with_the_contracted_shape() {
        let body = HealthResponse { status: "ok", uptime: 42 };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["uptime"], 42);
    }
}
