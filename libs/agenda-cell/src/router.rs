// libs/agenda-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;

pub fn agenda_routes(state: Arc<AppConfig>) -> Router {
    let protected_routes = Router::new()
        // Composed slot grid (read-only projection)
        .route(
            "/providers/{provider_id}/schedule",
            get(handlers::get_provider_schedule),
        )
        // Weekly template management
        .route("/templates", post(handlers::create_template))
        .route("/templates/{template_id}", put(handlers::update_template))
        .route("/templates/{template_id}", delete(handlers::delete_template))
        .route(
            "/providers/{provider_id}/templates",
            get(handlers::list_templates),
        )
        // One-off unavailability
        .route("/exceptions", post(handlers::create_exception))
        .route(
            "/exceptions/{exception_id}",
            delete(handlers::delete_exception),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new().merge(protected_routes).with_state(state)
}
