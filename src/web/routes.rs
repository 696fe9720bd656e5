use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let camera_routes = Router::new()
        .route("/cameras", get(handlers::list_cameras))
        .route("/cameras/:id/webrtc", post(handlers::camera_webrtc))
        .route("/cameras/:id/snapshot", get(handlers::camera_snapshot))
        .route("/cameras/:id/info", get(handlers::camera_info));

    let session_routes = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/:id", delete(handlers::close_session))
        .route("/webrtc/ice-servers", get(handlers::webrtc_ice_servers));

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(camera_routes)
        .merge(session_routes);

    let router = Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http());

    // Browser players are usually served from another origin
    let router = if state.config.get().web.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    };

    router.with_state(state)
}
