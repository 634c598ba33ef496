use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Natural-language querying
            .route("/ask", post(handlers::api::ask))
            // Queryable objects and their columns
            .route("/catalog", get(handlers::api::get_catalog))
            // Latest sales date per store
            .route("/freshness/{store_id}", get(handlers::api::get_freshness))
            // Reload CSVs into base tables and rebuild views
            .route("/seed", post(handlers::api::seed))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
