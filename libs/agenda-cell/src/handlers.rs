// libs/agenda-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{
    AgendaError, CreateExceptionRequest, CreateTemplateRequest, ScheduleQuery,
    UpdateTemplateRequest,
};
use crate::services::composer::ScheduleComposer;
use crate::services::templates::TemplateService;

fn map_agenda_error(e: AgendaError) -> AppError {
    match e {
        AgendaError::ProviderNotFound => AppError::NotFound("Provider not found".to_string()),
        AgendaError::TemplateNotFound => {
            AppError::NotFound("Availability template not found".to_string())
        }
        AgendaError::ExceptionNotFound => {
            AppError::NotFound("Unavailability exception not found".to_string())
        }
        AgendaError::ValidationError(msg) => AppError::ValidationError(msg),
        AgendaError::TemplateOverlap => {
            AppError::Conflict("Template overlaps an existing schedule".to_string())
        }
        AgendaError::DatabaseError(msg) => AppError::Database(msg),
    }
}

/// A provider may manage their own agenda; staff may manage any agenda.
fn ensure_can_manage_agenda(user: &User, provider_id: Uuid) -> Result<(), AppError> {
    let is_owner = provider_id.to_string() == user.id;
    if !is_owner && !user.is_staff() {
        return Err(AppError::Auth(
            "Not authorized to manage this provider's agenda".to_string(),
        ));
    }
    Ok(())
}

#[axum::debug_handler]
pub async fn get_provider_schedule(
    State(state): State<Arc<AppConfig>>,
    Path(provider_id): Path<Uuid>,
    Query(query): Query<ScheduleQuery>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(_user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let composer = ScheduleComposer::new(&state);

    let days = composer
        .compose(provider_id, query.from, query.to, token)
        .await
        .map_err(map_agenda_error)?;

    Ok(Json(json!({
        "provider_id": provider_id,
        "from": query.from,
        "to": query.to,
        "days": days
    })))
}

#[axum::debug_handler]
pub async fn create_template(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    ensure_can_manage_agenda(&user, request.provider_id)?;

    let service = TemplateService::new(&state);
    let template = service
        .create_template(request, token)
        .await
        .map_err(map_agenda_error)?;

    Ok(Json(json!({
        "success": true,
        "template": template
    })))
}

#[axum::debug_handler]
pub async fn update_template(
    State(state): State<Arc<AppConfig>>,
    Path(template_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<UpdateTemplateRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let service = TemplateService::new(&state);

    // Ownership is checked against the stored row, not the request body.
    let owner = service
        .template_owner(template_id, token)
        .await
        .map_err(map_agenda_error)?;
    ensure_can_manage_agenda(&user, owner)?;

    let template = service
        .update_template(template_id, request, token)
        .await
        .map_err(map_agenda_error)?;

    Ok(Json(json!({
        "success": true,
        "template": template
    })))
}

#[axum::debug_handler]
pub async fn delete_template(
    State(state): State<Arc<AppConfig>>,
    Path(template_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let service = TemplateService::new(&state);

    let owner = service
        .template_owner(template_id, token)
        .await
        .map_err(map_agenda_error)?;
    ensure_can_manage_agenda(&user, owner)?;

    service
        .delete_template(template_id, token)
        .await
        .map_err(map_agenda_error)?;

    Ok(Json(json!({
        "success": true,
        "message": "Availability template deleted"
    })))
}

#[axum::debug_handler]
pub async fn list_templates(
    State(state): State<Arc<AppConfig>>,
    Path(provider_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(_user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let service = TemplateService::new(&state);

    let templates = service
        .list_templates(provider_id, token)
        .await
        .map_err(map_agenda_error)?;

    Ok(Json(json!({
        "provider_id": provider_id,
        "templates": templates,
        "total": templates.len()
    })))
}

#[axum::debug_handler]
pub async fn create_exception(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateExceptionRequest>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    ensure_can_manage_agenda(&user, request.provider_id)?;

    let service = TemplateService::new(&state);
    let exception = service
        .create_exception(request, token)
        .await
        .map_err(map_agenda_error)?;

    Ok(Json(json!({
        "success": true,
        "exception": exception
    })))
}

#[axum::debug_handler]
pub async fn delete_exception(
    State(state): State<Arc<AppConfig>>,
    Path(exception_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let token = auth.token();
    let service = TemplateService::new(&state);

    let owner = service
        .exception_owner(exception_id, token)
        .await
        .map_err(map_agenda_error)?;
    ensure_can_manage_agenda(&user, owner)?;

    service
        .delete_exception(exception_id, token)
        .await
        .map_err(map_agenda_error)?;

    Ok(Json(json!({
        "success": true,
        "message": "Unavailability exception deleted"
    })))
}
