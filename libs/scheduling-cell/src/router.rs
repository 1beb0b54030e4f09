// libs/scheduling-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::services::events::{BroadcastEventPublisher, EventPublisher};

/// Router state: configuration plus the long-lived event publisher shared by
/// every request (subscribers must outlive individual requests).
#[derive(Clone)]
pub struct SchedulingState {
    pub config: Arc<AppConfig>,
    pub events: Arc<BroadcastEventPublisher>,
}

impl SchedulingState {
    pub fn new(config: Arc<AppConfig>, events: Arc<BroadcastEventPublisher>) -> Self {
        Self { config, events }
    }

    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.events.clone()
    }
}

pub fn scheduling_routes(config: Arc<AppConfig>, events: Arc<BroadcastEventPublisher>) -> Router {
    let state = SchedulingState::new(config.clone(), events);

    // All scheduling operations require authentication. Slot-lock acquisition
    // has no route of its own: it is an internal step of the booking flow.
    let protected_routes = Router::new()
        .route("/", post(handlers::create_appointment))
        .route("/upcoming", get(handlers::get_upcoming_appointments))
        .route("/history", get(handlers::get_appointment_history))
        .route("/{appointment_id}", get(handlers::get_appointment))
        .route("/{appointment_id}", put(handlers::update_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        // Guarded lifecycle transitions
        .route("/{appointment_id}/confirm", post(handlers::confirm_appointment))
        .route("/{appointment_id}/start", post(handlers::start_appointment))
        .route("/{appointment_id}/complete", post(handlers::complete_appointment))
        // Reschedule negotiation
        .route("/{appointment_id}/proposal", post(handlers::propose_reschedule))
        .route(
            "/{appointment_id}/proposal/accept",
            post(handlers::accept_proposal),
        )
        .route(
            "/{appointment_id}/proposal/refuse",
            post(handlers::refuse_proposal),
        )
        .layer(middleware::from_fn_with_state(config, auth_middleware));

    Router::new().merge(protected_routes).with_state(state)
}
