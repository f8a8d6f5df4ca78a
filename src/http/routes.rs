//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::util::time::{unix_millis, uptime_secs};
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/stats", get(stats_handler))
        .route("/admin/matches/:id", get(match_handler))
        .route("/game", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.client_origin))
        .with_state(state)
}

/// CORS from a comma-separated origin list; `*` allows any origin
fn cors_layer(client_origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.split(',').any(|s| s.trim() == "*") {
        return base.allow_origin(Any);
    }

    let allowed_origins: Vec<HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    base.allow_origin(allowed_origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
    })
}

// ============================================================================
// Admin endpoints
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    practice_tick: u64,
    practice_players: usize,
    active_matches: usize,
    match_players: usize,
    queue_size: usize,
    sessions: usize,
    pending_positions: usize,
    dropped_positions: u64,
    uptime_secs: u64,
    timestamp: u64,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        practice_tick: state.practice.tick_count(),
        practice_players: state.practice.active_players(),
        active_matches: state.match_registry.active_matches(),
        match_players: state.match_registry.total_players(),
        queue_size: state.matchmaker.queue_size(),
        sessions: state.sessions.len(),
        pending_positions: state.positions.pending(),
        dropped_positions: state.positions.dropped(),
        uptime_secs: uptime_secs(),
        timestamp: unix_millis(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchResponse {
    id: Uuid,
    players: usize,
    finished: bool,
}

async fn match_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MatchResponse>, AppError> {
    let id = Uuid::parse_str(&id).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let handle = state
        .match_registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("match {id}")))?;

    Ok(Json(MatchResponse {
        id: handle.id,
        players: handle.player_count(),
        finished: handle.is_finished(),
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        };

        let body = serde_json::json!({
            "error": self.to_string()
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::config::Config;

    fn router() -> (Router, AppState, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let config = Config {
            position_log_enabled: false,
            ..Config::default()
        };
        let (state, _background) = AppState::new(config, rx);
        (build_router(state.clone()), state, tx)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (router, _state, _tx) = router();
        let (status, body) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn stats_reflect_queue_and_matches() {
        let (router, state, _tx) = router();
        state.matchmaker.enqueue("ana", None);
        state.matchmaker.enqueue("bo", None);
        state.matchmaker.enqueue("cy", None);

        let (status, body) = get_json(router, "/admin/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activeMatches"], 1);
        assert_eq!(body["queueSize"], 1);
        assert_eq!(body["pendingPositions"], 0);
        assert!(body["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn match_lookup_by_id() {
        let (router, state, _tx) = router();
        state.matchmaker.enqueue("ana", None);
        state.matchmaker.enqueue("bo", None);
        let id = state.matchmaker.match_of("ana").unwrap();

        let (status, body) = get_json(router.clone(), &format!("/admin/matches/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["players"], 2);
        assert_eq!(body["finished"], false);

        let (status, _) = get_json(router.clone(), &format!("/admin/matches/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(router, "/admin/matches/nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn explicit_origins_are_parsed() {
        // Builds without panicking for both forms
        let _ = cors_layer("*");
        let _ = cors_layer("http://localhost:5173, https://play.example.com");
    }
}
