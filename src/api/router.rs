use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::require_auth;
use super::handlers;
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    // Public routes — no authentication required
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render));

    // Protected API routes — require Bearer token when API_TOKEN is set
    let protected = Router::new()
        // Markets
        .route("/api/markets", get(handlers::markets::list))
        .route("/api/markets/resolved", get(handlers::markets::resolved))
        .route("/api/markets/:id", get(handlers::markets::detail))
        // Watch list
        .route("/api/watch", get(handlers::watch::list))
        .route(
            "/api/watch/:id",
            post(handlers::watch::register).delete(handlers::watch::release),
        )
        // Settlement feed ingress
        .route("/api/settlements", post(handlers::settlements::submit))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
