use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::handlers;
use super::state::AppState;

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/api/nodes", get(handlers::list_nodes).post(handlers::create_node))
        .route(
            "/api/nodes/:id",
            get(handlers::get_node)
                .patch(handlers::update_node)
                .delete(handlers::delete_node),
        )
        .route("/api/stats", get(handlers::get_statistics))
        .route(
            "/api/scheduler",
            get(handlers::get_scheduler).put(handlers::set_scheduler),
        )
        .route("/api/rules", get(handlers::list_rules).post(handlers::add_rule))
        .route("/api/rules/:name", axum::routing::delete(handlers::remove_rule))
        .route("/api/health-check", post(handlers::run_health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
