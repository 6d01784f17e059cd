//! REST API - Synchronous presence queries

use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::api::middleware::AuthUser;
use crate::api::AppState;
use crate::presence::leaderboard::{self, LeaderboardError, DEFAULT_LIMIT, MAX_LIMIT};

pub fn routes() -> Router {
    Router::new().route("/leaderboard", get(get_leaderboard))
}

#[derive(Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

/// GET /presence/leaderboard?limit=N
///
/// Online mutuals of the authenticated user, online first, most recently
/// updated first.
async fn get_leaderboard(
    Extension(state): Extension<Arc<AppState>>,
    auth: Option<Extension<AuthUser>>,
    Query(query): Query<LeaderboardQuery>,
) -> Response {
    let Some(Extension(AuthUser(user_id))) = auth else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("limit must be within 1..={}", MAX_LIMIT) })),
        )
            .into_response();
    }

    let now = chrono::Utc::now().timestamp();
    match leaderboard::online_mutuals(&state.store, state.graph.as_ref(), user_id, limit, now).await
    {
        Ok(friends) => Json(json!({ "friends": friends })).into_response(),
        Err(LeaderboardError::Kv(e)) if e.is_transient() => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "presence store unavailable" })),
        )
            .into_response(),
        Err(LeaderboardError::GraphUnavailable(e)) => {
            warn!("leaderboard graph lookup failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "follow graph unavailable" })),
            )
                .into_response()
        }
        Err(e) => {
            warn!("leaderboard for {} failed: {}", user_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
