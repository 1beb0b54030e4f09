// libs/scheduling-cell/src/handlers.rs
use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{
    AcceptProposalRequest, AppointmentStatus, CancelActor, CancelAppointmentRequest,
    CreateAppointmentRequest, ProposeRescheduleRequest, RefuseProposalRequest, SchedulingError,
    TransitionRequest, UpdateAppointmentRequest,
};
use crate::router::SchedulingState;
use crate::services::booking::BookingService;
use crate::services::proposal::ProposalService;

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQueryParams {
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

fn map_scheduling_error(e: SchedulingError) -> AppError {
    match e {
        SchedulingError::NotFound => AppError::NotFound("Appointment not found".to_string()),
        SchedulingError::ProviderNotFound => AppError::NotFound("Provider not found".to_string()),
        SchedulingError::SlotUnavailable => {
            AppError::Conflict("Requested slot is not available".to_string())
        }
        SchedulingError::Conflict => {
            AppError::Conflict("Appointment conflicts with an existing booking".to_string())
        }
        SchedulingError::StaleVersion => AppError::Conflict(
            "Appointment was modified concurrently; reload and retry".to_string(),
        ),
        SchedulingError::AlreadyCancelled => {
            AppError::Conflict("Appointment is already cancelled".to_string())
        }
        SchedulingError::InvalidStatusTransition(status) => {
            AppError::BadRequest(format!("Cannot change appointment from status: {}", status))
        }
        SchedulingError::InvalidProposalTransition(state) => {
            AppError::BadRequest(format!("Cannot change proposal from state: {}", state))
        }
        SchedulingError::ValidationError(msg) => AppError::ValidationError(msg),
        SchedulingError::Unauthorized => {
            AppError::Auth("Not authorized for this appointment".to_string())
        }
        SchedulingError::DatabaseError(msg) => AppError::Database(msg),
    }
}

fn cancel_actor_for(user: &User) -> CancelActor {
    if user.is_provider() {
        CancelActor::Provider
    } else if user.is_staff() {
        CancelActor::Staff
    } else {
        CancelActor::Patient
    }
}

// ==============================================================================
// APPOINTMENT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_appointment(
    State(state): State<SchedulingState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();

    // Patients book for themselves; providers and staff may book on behalf
    // of any patient.
    let is_self = request.patient_id.to_string() == user.id;
    if !is_self && !user.is_provider() && !user.is_staff() {
        return Err(AppError::Auth(
            "Not authorized to book an appointment for this patient".to_string(),
        ));
    }

    let booking_service = BookingService::new(&state.config, state.publisher());

    let appointment = booking_service
        .create_appointment(request, &user, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment booked successfully"
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking_service = BookingService::new(&state.config, state.publisher());

    let appointment = booking_service
        .get_appointment(appointment_id, token)
        .await
        .map_err(map_scheduling_error)?;

    let is_patient = appointment.patient_id.to_string() == user.id;
    let is_provider = appointment.provider_id.to_string() == user.id;

    if !is_patient && !is_provider && !user.is_staff() {
        return Err(AppError::Auth(
            "Not authorized to view this appointment".to_string(),
        ));
    }

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn update_appointment(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<UpdateAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking_service = BookingService::new(&state.config, state.publisher());

    let appointment = booking_service
        .get_appointment(appointment_id, token)
        .await
        .map_err(map_scheduling_error)?;

    let is_patient = appointment.patient_id.to_string() == user.id;
    let is_provider = appointment.provider_id.to_string() == user.id;

    if !is_patient && !is_provider && !user.is_staff() {
        return Err(AppError::Auth(
            "Not authorized to update this appointment".to_string(),
        ));
    }

    let updated = booking_service
        .update_appointment(appointment_id, request, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": updated,
        "message": "Appointment updated successfully"
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CancelAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking_service = BookingService::new(&state.config, state.publisher());

    let appointment = booking_service
        .get_appointment(appointment_id, token)
        .await
        .map_err(map_scheduling_error)?;

    let is_patient = appointment.patient_id.to_string() == user.id;
    let is_provider = appointment.provider_id.to_string() == user.id;

    if !is_patient && !is_provider && !user.is_staff() {
        return Err(AppError::Auth(
            "Not authorized to cancel this appointment".to_string(),
        ));
    }

    let cancelled = booking_service
        .cancel_appointment(appointment_id, request, cancel_actor_for(&user), token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": cancelled,
        "message": "Appointment cancelled successfully"
    })))
}

async fn transition_handler(
    state: SchedulingState,
    appointment_id: Uuid,
    target: AppointmentStatus,
    request: TransitionRequest,
    user: User,
    token: &str,
) -> Result<Json<Value>, AppError> {
    let booking_service = BookingService::new(&state.config, state.publisher());

    let appointment = booking_service
        .get_appointment(appointment_id, token)
        .await
        .map_err(map_scheduling_error)?;

    // Status moves are a provider/staff concern.
    let is_provider = appointment.provider_id.to_string() == user.id;
    if !is_provider && !user.is_staff() {
        return Err(AppError::Auth(
            "Not authorized to change this appointment's status".to_string(),
        ));
    }

    let updated = booking_service
        .transition_status(appointment_id, target, request.version, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": updated
    })))
}

#[axum::debug_handler]
pub async fn confirm_appointment(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Value>, AppError> {
    transition_handler(
        state,
        appointment_id,
        AppointmentStatus::Confirme,
        request,
        user,
        auth.token(),
    )
    .await
}

#[axum::debug_handler]
pub async fn start_appointment(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Value>, AppError> {
    transition_handler(
        state,
        appointment_id,
        AppointmentStatus::EnCours,
        request,
        user,
        auth.token(),
    )
    .await
}

#[axum::debug_handler]
pub async fn complete_appointment(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Value>, AppError> {
    transition_handler(
        state,
        appointment_id,
        AppointmentStatus::Termine,
        request,
        user,
        auth.token(),
    )
    .await
}

// ==============================================================================
// APPOINTMENT LISTING HANDLERS
// ==============================================================================

fn role_scope(user: &User) -> Result<(Option<Uuid>, Option<Uuid>), AppError> {
    match user.role.as_deref() {
        Some("provider") => {
            let provider_uuid = Uuid::parse_str(&user.id)
                .map_err(|_| AppError::BadRequest("Invalid provider ID".to_string()))?;
            Ok((None, Some(provider_uuid)))
        }
        Some("staff") => Ok((None, None)),
        _ => {
            let patient_uuid = Uuid::parse_str(&user.id)
                .map_err(|_| AppError::BadRequest("Invalid patient ID".to_string()))?;
            Ok((Some(patient_uuid), None))
        }
    }
}

#[axum::debug_handler]
pub async fn get_upcoming_appointments(
    State(state): State<SchedulingState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking_service = BookingService::new(&state.config, state.publisher());

    let (patient_id, provider_id) = role_scope(&user)?;

    let appointments = booking_service
        .list_upcoming(patient_id, provider_id, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "upcoming_appointments": appointments,
        "total": appointments.len()
    })))
}

#[axum::debug_handler]
pub async fn get_appointment_history(
    State(state): State<SchedulingState>,
    Query(params): Query<HistoryQueryParams>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let booking_service = BookingService::new(&state.config, state.publisher());

    let (patient_id, provider_id) = role_scope(&user)?;

    let appointments = booking_service
        .list_history(patient_id, provider_id, params.limit, params.offset, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len(),
        "limit": params.limit,
        "offset": params.offset
    })))
}

// ==============================================================================
// PROPOSAL WORKFLOW HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn propose_reschedule(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<ProposeRescheduleRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let proposal_service = ProposalService::new(&state.config, state.publisher());

    let appointment = proposal_service
        .propose(appointment_id, request, &user, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Reschedule proposed; awaiting patient response"
    })))
}

#[axum::debug_handler]
pub async fn accept_proposal(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<AcceptProposalRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let proposal_service = ProposalService::new(&state.config, state.publisher());

    let appointment = proposal_service
        .accept(appointment_id, request, &user, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Reschedule accepted"
    })))
}

#[axum::debug_handler]
pub async fn refuse_proposal(
    State(state): State<SchedulingState>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<RefuseProposalRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let proposal_service = ProposalService::new(&state.config, state.publisher());

    let appointment = proposal_service
        .refuse(appointment_id, request, &user, token)
        .await
        .map_err(map_scheduling_error)?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Reschedule refused"
    })))
}
