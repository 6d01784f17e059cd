//! API Layer - WebSocket sessions and REST queries

pub mod middleware;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bus::FanoutBus;
use crate::config::Config;
use crate::graph::FollowGraph;
use crate::health::{HealthMonitor, HealthStatus};
use crate::kv::KvStore;
use crate::metrics;
use crate::presence::PresenceStore;
use crate::session::SessionRegistry;

/// Everything a request handler needs, wired once at startup. Handles are
/// passed in explicitly so tests run the full router against fakes.
pub struct AppState {
    pub config: Config,
    pub store: Arc<PresenceStore>,
    pub kv: Arc<dyn KvStore>,
    pub bus: Arc<dyn FanoutBus>,
    pub graph: Arc<dyn FollowGraph>,
    pub registry: Arc<SessionRegistry>,
    pub health: HealthMonitor,
}

/// Create the main API router
pub fn router(state: Arc<AppState>) -> Router {
    metrics::register_default_metrics();

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/ws/presence", get(ws::handler))
        .nest("/presence", rest::routes())
        .layer(axum::middleware::from_fn(middleware::auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(state))
}

async fn health_check(Extension(state): Extension<Arc<AppState>>) -> Response {
    let snapshot = state.health.check(state.registry.count().await).await;
    let code = if snapshot.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(snapshot)).into_response()
}

async fn metrics_handler() -> String {
    metrics::encode()
}
