use std::sync::Arc;

use axum::{routing::get, Router};

use agenda_cell::router::agenda_routes;
use scheduling_cell::router::scheduling_routes;
use scheduling_cell::BroadcastEventPublisher;
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>) -> Router {
    // One publisher for the process: real-time consumers subscribe to it and
    // must see events from every request.
    let events = Arc::new(BroadcastEventPublisher::new());

    Router::new()
        .route("/", get(|| async { "Mediplan scheduling API is running!" }))
        .nest("/agenda", agenda_routes(state.clone()))
        .nest("/appointments", scheduling_routes(state.clone(), events))
}
