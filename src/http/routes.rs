//! HTTP route definitions

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::session::LobbyEntry;
use crate::rating::Leaderboard;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

pub const DEFAULT_LEADERBOARD_LIMIT: usize = 50;
pub const MAX_LEADERBOARD_LIMIT: usize = 200;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/leaderboard", get(leaderboard_handler))
        .route("/matches", get(matches_handler))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.client_origin))
        .with_state(state)
}

/// `*` allows any origin; otherwise a comma-separated allow list
fn cors_layer(client_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed_origins: Vec<HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed_origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.sessions.active_sessions(),
    })
}

// ============================================================================
// Leaderboard
// ============================================================================

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

async fn leaderboard_handler(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Leaderboard>, AppError> {
    let limit = match query.limit {
        None => DEFAULT_LEADERBOARD_LIMIT,
        Some(0) => return Err(AppError::BadRequest("limit must be positive".into())),
        Some(n) => n.min(MAX_LEADERBOARD_LIMIT),
    };

    // The ledger lock is shared with blocking writers
    let ratings = state.ratings.clone();
    let board = tokio::task::spawn_blocking(move || ratings.leaderboard(limit))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(board))
}

// ============================================================================
// Lobby
// ============================================================================

async fn matches_handler(State(state): State<AppState>) -> Json<Vec<LobbyEntry>> {
    Json(state.sessions.open_matches())
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EngineConfig, RatingConfig};
    use crate::game::r#match::MatchOutcome;
    use crate::game::{MatchEvent, SessionStore};
    use crate::rating::RatingStore;
    use crate::ws::protocol::{EndReason, Side};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let path = std::env::temp_dir()
            .join(format!("disc-duel-http-{}", uuid::Uuid::new_v4()))
            .join("ledger.json");
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".into(),
            client_origin: "*".into(),
            rating_store_path: path.clone(),
            engine: EngineConfig::default(),
            rating: RatingConfig::default(),
        };
        let ratings = Arc::new(RatingStore::load(path, RatingConfig::default()));
        let sessions = SessionStore::new(ratings.clone(), EngineConfig::default());
        AppState::from_parts(config, sessions, ratings)
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn win(winner: &str, loser: &str) -> MatchOutcome {
        MatchOutcome {
            match_id: "m".into(),
            winner: Side::Creator,
            reason: EndReason::Goals,
            winner_id: Some(winner.into()),
            winner_alias: Some(winner.into()),
            loser_id: Some(loser.into()),
            loser_alias: Some(loser.into()),
        }
    }

    #[tokio::test]
    async fn test_health_reports_sessions() {
        let (status, body) = get_json(test_state(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
    }

    #[tokio::test]
    async fn test_leaderboard_ranks_and_limits() {
        let state = test_state();
        state.ratings.record_result(&win("alice", "bob"));
        state.ratings.record_result(&win("carol", "dave"));

        let (status, body) = get_json(state.clone(), "/leaderboard").await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["rank"], 1);
        assert_eq!(entries[0]["player_id"], "alice");
        assert_eq!(entries[1]["player_id"], "carol");
        assert!(body["week_start"].is_u64());

        let (_, body) = get_json(state, "/leaderboard?limit=1").await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leaderboard_rejects_zero_limit() {
        let (status, body) = get_json(test_state(), "/leaderboard?limit=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_matches_lists_waiting_session() {
        let state = test_state();
        let join = MatchEvent::Join {
            side: Side::Creator,
            player_id: None,
            alias: Some("ana".into()),
        };
        let (_handle, mut rx) = state.sessions.attach("lobby-1", None, join).await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (status, body) = get_json(state, "/matches").await;
        assert_eq!(status, StatusCode::OK);
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["match_id"], "lobby-1");
        assert_eq!(list[0]["waiting_side"], "challenger");
        assert_eq!(list[0]["alias"], "ana");
    }
}
