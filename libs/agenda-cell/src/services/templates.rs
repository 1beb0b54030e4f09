// libs/agenda-cell/src/services/templates.rs
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::PostgrestClient;

use crate::models::{
    AgendaError, AvailabilityTemplate, CreateExceptionRequest, CreateTemplateRequest,
    UnavailabilityException, UpdateTemplateRequest,
};

/// Write-side management of weekly templates and unavailability exceptions.
pub struct TemplateService {
    store: PostgrestClient,
}

impl TemplateService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            store: PostgrestClient::new(config),
        }
    }

    pub async fn create_template(
        &self,
        request: CreateTemplateRequest,
        auth_token: &str,
    ) -> Result<AvailabilityTemplate, AgendaError> {
        debug!("Creating availability template for provider {}", request.provider_id);

        if request.start_time >= request.end_time {
            return Err(AgendaError::ValidationError(
                "Start time must be before end time".to_string(),
            ));
        }
        if !(1..=7).contains(&request.weekday) {
            return Err(AgendaError::ValidationError(
                "Weekday must be between 1 (Monday) and 7 (Sunday)".to_string(),
            ));
        }
        if let Some(minutes) = request.slot_minutes {
            if minutes <= 0 {
                return Err(AgendaError::ValidationError(
                    "Slot duration must be positive".to_string(),
                ));
            }
        }
        if let (Some(from), Some(until)) = (request.valid_from, request.valid_until) {
            if until < from {
                return Err(AgendaError::ValidationError(
                    "Validity end must not be before validity start".to_string(),
                ));
            }
        }

        self.check_template_overlap(&request, None, auth_token).await?;

        let now = Utc::now();
        let template_data = json!({
            "provider_id": request.provider_id,
            "weekday": request.weekday,
            "start_time": request.start_time.format("%H:%M:%S").to_string(),
            "end_time": request.end_time.format("%H:%M:%S").to_string(),
            "slot_minutes": request.slot_minutes,
            "active": true,
            "valid_from": request.valid_from,
            "valid_until": request.valid_until,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339()
        });

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let result: Vec<Value> = self
            .store
            .request_with_headers(
                Method::POST,
                "/rest/v1/availability_templates",
                Some(auth_token),
                Some(template_data),
                Some(headers),
            )
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        if result.is_empty() {
            return Err(AgendaError::DatabaseError(
                "Failed to create availability template".to_string(),
            ));
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse template: {}", e)))
    }

    pub async fn update_template(
        &self,
        template_id: Uuid,
        request: UpdateTemplateRequest,
        auth_token: &str,
    ) -> Result<AvailabilityTemplate, AgendaError> {
        debug!("Updating availability template {}", template_id);

        let current = self.get_template(template_id, auth_token).await?;

        let start = request.start_time.unwrap_or(current.start_time);
        let end = request.end_time.unwrap_or(current.end_time);
        if start >= end {
            return Err(AgendaError::ValidationError(
                "Start time must be before end time".to_string(),
            ));
        }

        if request.start_time.is_some() || request.end_time.is_some() {
            let probe = CreateTemplateRequest {
                provider_id: current.provider_id,
                weekday: current.weekday,
                start_time: start,
                end_time: end,
                slot_minutes: request.slot_minutes.or(current.slot_minutes),
                valid_from: request.valid_from.or(current.valid_from),
                valid_until: request.valid_until.or(current.valid_until),
            };
            self.check_template_overlap(&probe, Some(template_id), auth_token)
                .await?;
        }

        let mut update_data = serde_json::Map::new();
        if let Some(start_time) = request.start_time {
            update_data.insert(
                "start_time".to_string(),
                json!(start_time.format("%H:%M:%S").to_string()),
            );
        }
        if let Some(end_time) = request.end_time {
            update_data.insert(
                "end_time".to_string(),
                json!(end_time.format("%H:%M:%S").to_string()),
            );
        }
        if let Some(minutes) = request.slot_minutes {
            if minutes <= 0 {
                return Err(AgendaError::ValidationError(
                    "Slot duration must be positive".to_string(),
                ));
            }
            update_data.insert("slot_minutes".to_string(), json!(minutes));
        }
        if let Some(active) = request.active {
            update_data.insert("active".to_string(), json!(active));
        }
        if let Some(valid_from) = request.valid_from {
            update_data.insert("valid_from".to_string(), json!(valid_from));
        }
        if let Some(valid_until) = request.valid_until {
            update_data.insert("valid_until".to_string(), json!(valid_until));
        }
        update_data.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));

        let path = format!("/rest/v1/availability_templates?id=eq.{}", template_id);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let result: Vec<Value> = self
            .store
            .request_with_headers(
                Method::PATCH,
                &path,
                Some(auth_token),
                Some(Value::Object(update_data)),
                Some(headers),
            )
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        if result.is_empty() {
            return Err(AgendaError::TemplateNotFound);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse template: {}", e)))
    }

    pub async fn delete_template(
        &self,
        template_id: Uuid,
        auth_token: &str,
    ) -> Result<(), AgendaError> {
        debug!("Deleting availability template {}", template_id);

        let path = format!("/rest/v1/availability_templates?id=eq.{}", template_id);
        let _: Vec<Value> = self
            .store
            .request(Method::DELETE, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    pub async fn list_templates(
        &self,
        provider_id: Uuid,
        auth_token: &str,
    ) -> Result<Vec<AvailabilityTemplate>, AgendaError> {
        let path = format!(
            "/rest/v1/availability_templates?provider_id=eq.{}&order=weekday.asc,start_time.asc",
            provider_id
        );
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<AvailabilityTemplate>, _>>()
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse templates: {}", e)))
    }

    pub async fn create_exception(
        &self,
        request: CreateExceptionRequest,
        auth_token: &str,
    ) -> Result<UnavailabilityException, AgendaError> {
        debug!(
            "Creating unavailability exception for provider {} from {} to {}",
            request.provider_id, request.start_date, request.end_date
        );

        if request.end_date < request.start_date {
            return Err(AgendaError::ValidationError(
                "End date must not be before start date".to_string(),
            ));
        }
        if !request.full_day {
            match (request.start_time, request.end_time) {
                (Some(start), Some(end)) if start < end => {}
                _ => {
                    return Err(AgendaError::ValidationError(
                        "A partial-day exception requires a valid time window".to_string(),
                    ))
                }
            }
        }

        let exception_data = json!({
            "provider_id": request.provider_id,
            "start_date": request.start_date,
            "end_date": request.end_date,
            "full_day": request.full_day,
            "start_time": request.start_time.map(|t| t.format("%H:%M:%S").to_string()),
            "end_time": request.end_time.map(|t| t.format("%H:%M:%S").to_string()),
            "reason": request.reason,
            "created_at": Utc::now().to_rfc3339()
        });

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let result: Vec<Value> = self
            .store
            .request_with_headers(
                Method::POST,
                "/rest/v1/unavailability_exceptions",
                Some(auth_token),
                Some(exception_data),
                Some(headers),
            )
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        if result.is_empty() {
            return Err(AgendaError::DatabaseError(
                "Failed to create unavailability exception".to_string(),
            ));
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse exception: {}", e)))
    }

    pub async fn delete_exception(
        &self,
        exception_id: Uuid,
        auth_token: &str,
    ) -> Result<(), AgendaError> {
        debug!("Deleting unavailability exception {}", exception_id);

        let path = format!("/rest/v1/unavailability_exceptions?id=eq.{}", exception_id);
        let _: Vec<Value> = self
            .store
            .request(Method::DELETE, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Provider owning a template, for ownership checks before mutation.
    pub async fn template_owner(
        &self,
        template_id: Uuid,
        auth_token: &str,
    ) -> Result<Uuid, AgendaError> {
        let template = self.get_template(template_id, auth_token).await?;
        Ok(template.provider_id)
    }

    /// Provider owning an exception, for ownership checks before mutation.
    pub async fn exception_owner(
        &self,
        exception_id: Uuid,
        auth_token: &str,
    ) -> Result<Uuid, AgendaError> {
        let path = format!("/rest/v1/unavailability_exceptions?id=eq.{}", exception_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        if result.is_empty() {
            return Err(AgendaError::ExceptionNotFound);
        }

        let exception: UnavailabilityException = serde_json::from_value(result[0].clone())
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse exception: {}", e)))?;
        Ok(exception.provider_id)
    }

    // ==========================================================================
    // PRIVATE HELPERS
    // ==========================================================================

    async fn get_template(
        &self,
        template_id: Uuid,
        auth_token: &str,
    ) -> Result<AvailabilityTemplate, AgendaError> {
        let path = format!("/rest/v1/availability_templates?id=eq.{}", template_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        if result.is_empty() {
            return Err(AgendaError::TemplateNotFound);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse template: {}", e)))
    }

    async fn check_template_overlap(
        &self,
        request: &CreateTemplateRequest,
        exclude_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<(), AgendaError> {
        let mut path = format!(
            "/rest/v1/availability_templates?provider_id=eq.{}&weekday=eq.{}&active=eq.true",
            request.provider_id, request.weekday
        );
        if let Some(id) = exclude_id {
            path.push_str(&format!("&id=neq.{}", id));
        }

        let existing: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        for row in existing {
            let template: AvailabilityTemplate = serde_json::from_value(row)
                .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse template: {}", e)))?;

            if request.start_time < template.end_time && template.start_time < request.end_time {
                return Err(AgendaError::TemplateOverlap);
            }
        }

        Ok(())
    }
}
