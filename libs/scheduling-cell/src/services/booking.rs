// libs/scheduling-cell/src/services/booking.rs
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use agenda_cell::models::{AgendaError, Provider, SlotStatus};
use agenda_cell::ScheduleComposer;
use shared_config::AppConfig;
use shared_database::{DbError, PostgrestClient};
use shared_models::auth::User;

use crate::models::{
    Appointment, AppointmentSearchQuery, AppointmentStatus, CancelActor,
    CancelAppointmentRequest, CreateAppointmentRequest, SchedulingError,
    UpdateAppointmentRequest,
};
use crate::services::events::{DomainEvent, EventPublisher};
use crate::services::lifecycle::AppointmentLifecycleService;
use crate::services::slot_lock::SlotLockService;

/// Authoritative appointment writes.
///
/// Two-phase guard: the advisory slot lock narrows the race window before a
/// commit, and the write-time overlap check against the appointment store is
/// the sole source of truth. It never trusts lock state, since a lock may
/// have expired or been bypassed.
pub struct BookingService {
    store: Arc<PostgrestClient>,
    composer: ScheduleComposer,
    slot_locks: SlotLockService,
    lifecycle: AppointmentLifecycleService,
    publisher: Arc<dyn EventPublisher>,
}

impl BookingService {
    pub fn new(config: &AppConfig, publisher: Arc<dyn EventPublisher>) -> Self {
        let store = Arc::new(PostgrestClient::new(config));

        Self {
            composer: ScheduleComposer::new(config),
            slot_locks: SlotLockService::new(Arc::clone(&store), config.slot_lock_ttl_minutes),
            lifecycle: AppointmentLifecycleService::new(),
            publisher,
            store,
        }
    }

    /// Book a slot for a patient with a provider.
    ///
    /// Initial status depends on who books: patient self-service lands in
    /// `planifie`, staff- or provider-initiated bookings in `confirme`.
    pub async fn create_appointment(
        &self,
        request: CreateAppointmentRequest,
        requester: &User,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        info!(
            "Booking appointment for patient {} with provider {} at {}",
            request.patient_id, request.provider_id, request.scheduled_at
        );

        let provider = self.get_provider(request.provider_id, auth_token).await?;
        if !provider.active {
            return Err(SchedulingError::SlotUnavailable);
        }

        let duration_minutes = match request.duration_minutes {
            Some(minutes) if minutes > 0 => minutes,
            Some(_) => {
                return Err(SchedulingError::ValidationError(
                    "Duration must be positive".to_string(),
                ))
            }
            None => provider.default_slot_minutes,
        };

        if request.scheduled_at <= Utc::now() {
            return Err(SchedulingError::ValidationError(
                "Appointment must be scheduled for a future time".to_string(),
            ));
        }

        // Phase 0: the requested time must be an open slot of the composed
        // availability grid.
        self.validate_slot_in_availability(
            request.provider_id,
            request.scheduled_at,
            None,
            auth_token,
        )
        .await?;

        let holder_id = requester_uuid(requester)?;
        let initial_status = if requester.is_patient() {
            AppointmentStatus::Planifie
        } else {
            AppointmentStatus::Confirme
        };

        // Phase 1: advisory lock narrows the race window.
        let lock = self
            .acquire_slot_lock(
                request.provider_id,
                request.scheduled_at,
                duration_minutes,
                holder_id,
            )
            .await?;

        // Phase 2: authoritative overlap check at write time, independent of
        // any lock state.
        let ends_at = request.scheduled_at + ChronoDuration::minutes(duration_minutes as i64);
        let overlapping = self
            .get_overlapping_appointments(
                request.provider_id,
                request.scheduled_at,
                ends_at,
                None,
                auth_token,
            )
            .await;

        let result = match overlapping {
            Ok(existing) if !existing.is_empty() => {
                warn!(
                    "Overlap detected at write time for provider {} at {}",
                    request.provider_id, request.scheduled_at
                );
                Err(SchedulingError::Conflict)
            }
            Ok(_) => {
                self.insert_appointment(&request, duration_minutes, initial_status, auth_token)
                    .await
            }
            Err(e) => Err(e),
        };

        self.release_lock(request.provider_id, &lock).await;

        let appointment = result?;

        self.publisher
            .publish(DomainEvent::AppointmentCreated {
                provider_id: appointment.provider_id,
                appointment_id: appointment.id,
                patient_id: appointment.patient_id,
                scheduled_at: appointment.scheduled_at,
            })
            .await;
        self.publisher
            .publish(DomainEvent::SlotsUpdated {
                provider_id: appointment.provider_id,
                date: appointment.scheduled_at.date_naive(),
            })
            .await;

        info!("Appointment {} booked successfully", appointment.id);
        Ok(appointment)
    }

    /// Update fields of an appointment under optimistic concurrency.
    pub async fn update_appointment(
        &self,
        appointment_id: Uuid,
        request: UpdateAppointmentRequest,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Updating appointment {}", appointment_id);

        let current = self.get_appointment(appointment_id, auth_token).await?;

        if self.lifecycle.is_terminal(&current.status) {
            return Err(SchedulingError::InvalidStatusTransition(current.status));
        }
        if current.version != request.version {
            return Err(SchedulingError::StaleVersion);
        }

        let new_start = request.scheduled_at.unwrap_or(current.scheduled_at);
        let new_duration = match request.duration_minutes {
            Some(minutes) if minutes > 0 => minutes,
            Some(_) => {
                return Err(SchedulingError::ValidationError(
                    "Duration must be positive".to_string(),
                ))
            }
            None => current.duration_minutes,
        };
        let rescheduling =
            new_start != current.scheduled_at || new_duration != current.duration_minutes;

        let mut update_data = serde_json::Map::new();
        if let Some(reason) = &request.reason {
            update_data.insert("reason".to_string(), json!(reason));
        }
        if let Some(notes) = &request.notes {
            update_data.insert("notes".to_string(), json!(notes));
        }

        if rescheduling {
            if new_start <= Utc::now() {
                return Err(SchedulingError::ValidationError(
                    "Appointment must be scheduled for a future time".to_string(),
                ));
            }

            self.validate_slot_in_availability(
                current.provider_id,
                new_start,
                Some(appointment_id),
                auth_token,
            )
            .await?;

            let new_end = new_start + ChronoDuration::minutes(new_duration as i64);
            let overlapping = self
                .get_overlapping_appointments(
                    current.provider_id,
                    new_start,
                    new_end,
                    Some(appointment_id),
                    auth_token,
                )
                .await?;
            if !overlapping.is_empty() {
                return Err(SchedulingError::Conflict);
            }

            update_data.insert("scheduled_at".to_string(), json!(new_start.to_rfc3339()));
            update_data.insert("ends_at".to_string(), json!(new_end.to_rfc3339()));
            update_data.insert("duration_minutes".to_string(), json!(new_duration));
        }

        let updated = self
            .commit_update(appointment_id, request.version, update_data, auth_token)
            .await?;

        self.publisher
            .publish(DomainEvent::AppointmentUpdated {
                provider_id: updated.provider_id,
                appointment_id: updated.id,
                scheduled_at: updated.scheduled_at,
            })
            .await;
        if rescheduling {
            for date in [current.scheduled_at.date_naive(), updated.scheduled_at.date_naive()] {
                self.publisher
                    .publish(DomainEvent::SlotsUpdated {
                        provider_id: updated.provider_id,
                        date,
                    })
                    .await;
            }
        }

        info!("Appointment {} updated successfully", appointment_id);
        Ok(updated)
    }

    /// Terminal cancellation with an audit trail, written exactly once.
    pub async fn cancel_appointment(
        &self,
        appointment_id: Uuid,
        request: CancelAppointmentRequest,
        actor: CancelActor,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Cancelling appointment {}", appointment_id);

        let current = self.get_appointment(appointment_id, auth_token).await?;

        if current.status == AppointmentStatus::Annule {
            return Err(SchedulingError::AlreadyCancelled);
        }
        self.lifecycle
            .validate_status_transition(&current.status, &AppointmentStatus::Annule)?;

        if current.version != request.version {
            return Err(SchedulingError::StaleVersion);
        }

        let mut update_data = serde_json::Map::new();
        update_data.insert("status".to_string(), json!(AppointmentStatus::Annule.to_string()));
        update_data.insert("cancelled_at".to_string(), json!(Utc::now().to_rfc3339()));
        update_data.insert("cancelled_by".to_string(), json!(actor.to_string()));
        update_data.insert("cancellation_reason".to_string(), json!(request.reason));

        let cancelled = self
            .commit_update(appointment_id, request.version, update_data, auth_token)
            .await?;

        self.publisher
            .publish(DomainEvent::AppointmentCancelled {
                provider_id: cancelled.provider_id,
                appointment_id: cancelled.id,
                cancelled_by: actor.to_string(),
            })
            .await;
        self.publisher
            .publish(DomainEvent::SlotsUpdated {
                provider_id: cancelled.provider_id,
                date: cancelled.scheduled_at.date_naive(),
            })
            .await;

        info!("Appointment {} cancelled by {}", appointment_id, actor);
        Ok(cancelled)
    }

    /// Guarded lifecycle transition (confirm, start visit, complete).
    pub async fn transition_status(
        &self,
        appointment_id: Uuid,
        target: AppointmentStatus,
        version: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        debug!(
            "Transitioning appointment {} to {}",
            appointment_id, target
        );

        let current = self.get_appointment(appointment_id, auth_token).await?;
        self.lifecycle
            .validate_status_transition(&current.status, &target)?;

        if current.version != version {
            return Err(SchedulingError::StaleVersion);
        }

        let mut update_data = serde_json::Map::new();
        update_data.insert("status".to_string(), json!(target.to_string()));

        let updated = self
            .commit_update(appointment_id, version, update_data, auth_token)
            .await?;

        self.publisher
            .publish(DomainEvent::AppointmentUpdated {
                provider_id: updated.provider_id,
                appointment_id: updated.id,
                scheduled_at: updated.scheduled_at,
            })
            .await;

        Ok(updated)
    }

    pub async fn get_appointment(
        &self,
        appointment_id: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Fetching appointment {}", appointment_id);

        let path = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(db_error)?;

        if result.is_empty() {
            return Err(SchedulingError::NotFound);
        }

        parse_appointment(result[0].clone())
    }

    pub async fn search_appointments(
        &self,
        query: AppointmentSearchQuery,
        auth_token: &str,
    ) -> Result<Vec<Appointment>, SchedulingError> {
        debug!("Searching appointments with filters: {:?}", query);

        let mut query_parts = Vec::new();

        if let Some(patient_id) = query.patient_id {
            query_parts.push(format!("patient_id=eq.{}", patient_id));
        }
        if let Some(provider_id) = query.provider_id {
            query_parts.push(format!("provider_id=eq.{}", provider_id));
        }
        if let Some(status) = query.status {
            query_parts.push(format!("status=eq.{}", status));
        }
        if let Some(from_date) = query.from_date {
            let encoded = urlencoding::encode(&from_date.to_rfc3339()).into_owned();
            query_parts.push(format!("scheduled_at=gte.{}", encoded));
        }
        if let Some(to_date) = query.to_date {
            let encoded = urlencoding::encode(&to_date.to_rfc3339()).into_owned();
            query_parts.push(format!("scheduled_at=lte.{}", encoded));
        }

        let mut path = format!(
            "/rest/v1/appointments?{}&order=scheduled_at.desc",
            query_parts.join("&")
        );

        if let Some(limit) = query.limit {
            path.push_str(&format!("&limit={}", limit));
        }
        if let Some(offset) = query.offset {
            path.push_str(&format!("&offset={}", offset));
        }

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(db_error)?;

        result.into_iter().map(parse_appointment).collect()
    }

    /// Active appointments from now on, for a patient or a provider.
    pub async fn list_upcoming(
        &self,
        patient_id: Option<Uuid>,
        provider_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<Vec<Appointment>, SchedulingError> {
        let query = AppointmentSearchQuery {
            patient_id,
            provider_id,
            status: None,
            from_date: Some(Utc::now()),
            to_date: None,
            limit: Some(50),
            offset: None,
        };

        let mut appointments = self.search_appointments(query, auth_token).await?;
        appointments.retain(|apt| {
            matches!(
                apt.status,
                AppointmentStatus::Planifie
                    | AppointmentStatus::Confirme
                    | AppointmentStatus::EnCours
            )
        });
        appointments.sort_by_key(|apt| apt.scheduled_at);

        Ok(appointments)
    }

    /// Past and terminated appointments, newest first.
    pub async fn list_history(
        &self,
        patient_id: Option<Uuid>,
        provider_id: Option<Uuid>,
        limit: Option<i32>,
        offset: Option<i32>,
        auth_token: &str,
    ) -> Result<Vec<Appointment>, SchedulingError> {
        let query = AppointmentSearchQuery {
            patient_id,
            provider_id,
            status: None,
            from_date: None,
            to_date: Some(Utc::now()),
            limit: Some(limit.unwrap_or(50)),
            offset,
        };

        self.search_appointments(query, auth_token).await
    }

    // ==========================================================================
    // SHARED INTERNALS (also used by the proposal workflow)
    // ==========================================================================

    /// The requested start must be an open slot of the composed grid.
    /// `exclude_appointment` lets a reschedule treat its own slot as free.
    pub(crate) async fn validate_slot_in_availability(
        &self,
        provider_id: Uuid,
        scheduled_at: DateTime<Utc>,
        exclude_appointment: Option<Uuid>,
        auth_token: &str,
    ) -> Result<(), SchedulingError> {
        let date = scheduled_at.date_naive();
        let days = self
            .composer
            .compose(provider_id, date, date, auth_token)
            .await
            .map_err(agenda_error)?;

        let day = days.first().ok_or(SchedulingError::SlotUnavailable)?;
        let slot = day
            .slots
            .iter()
            .find(|s| s.start_time == scheduled_at)
            .ok_or(SchedulingError::SlotUnavailable)?;

        match slot.status {
            SlotStatus::Available => Ok(()),
            // A reschedule may land on the slot its own booking occupies.
            SlotStatus::Occupied
                if exclude_appointment.is_some()
                    && slot.appointment_id == exclude_appointment =>
            {
                Ok(())
            }
            SlotStatus::Occupied => Err(SchedulingError::Conflict),
            SlotStatus::Unavailable => Err(SchedulingError::Conflict),
            SlotStatus::Past => Err(SchedulingError::ValidationError(
                "Appointment must be scheduled for a future time".to_string(),
            )),
        }
    }

    pub(crate) async fn get_overlapping_appointments(
        &self,
        provider_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
        auth_token: &str,
    ) -> Result<Vec<Appointment>, SchedulingError> {
        let mut query_parts = vec![
            format!("provider_id=eq.{}", provider_id),
            "status=neq.annule".to_string(),
            format!(
                "scheduled_at=lt.{}",
                urlencoding::encode(&end.to_rfc3339())
            ),
            format!("ends_at=gt.{}", urlencoding::encode(&start.to_rfc3339())),
        ];

        if let Some(exclude_id) = exclude_appointment_id {
            query_parts.push(format!("id=neq.{}", exclude_id));
        }

        let path = format!(
            "/rest/v1/appointments?{}&order=scheduled_at.asc",
            query_parts.join("&")
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(db_error)?;

        let appointments: Vec<Appointment> = result
            .into_iter()
            .map(parse_appointment)
            .collect::<Result<Vec<Appointment>, _>>()?;

        Ok(appointments
            .into_iter()
            .filter(|apt| apt.occupies_slot())
            .collect())
    }

    /// Compare-and-swap commit: the PATCH is filtered on the version the
    /// caller last observed, so a concurrent committed write makes the
    /// filter match nothing and the row is left untouched.
    pub(crate) async fn commit_update(
        &self,
        appointment_id: Uuid,
        expected_version: Uuid,
        mut update_data: serde_json::Map<String, Value>,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        update_data.insert("version".to_string(), json!(Uuid::new_v4()));
        update_data.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));

        let path = format!(
            "/rest/v1/appointments?id=eq.{}&version=eq.{}",
            appointment_id, expected_version
        );

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
            .map_err(db_error)?;

        if result.is_empty() {
            warn!(
                "Stale concurrency token for appointment {}; update not applied",
                appointment_id
            );
            return Err(SchedulingError::StaleVersion);
        }

        parse_appointment(result[0].clone())
    }

    pub(crate) async fn acquire_slot_lock(
        &self,
        provider_id: Uuid,
        slot_start: DateTime<Utc>,
        duration_minutes: i32,
        holder_id: Uuid,
    ) -> Result<crate::models::SlotLock, SchedulingError> {
        let lock = self
            .slot_locks
            .acquire(provider_id, slot_start, duration_minutes, holder_id)
            .await?;
        self.publisher
            .publish(DomainEvent::SlotLocked {
                provider_id,
                slot_start: lock.slot_start,
                expires_at: lock.expires_at,
            })
            .await;
        Ok(lock)
    }

    pub(crate) async fn release_lock(&self, provider_id: Uuid, lock: &crate::models::SlotLock) {
        // Passive expiry covers a failed release; do not fail the operation.
        if let Err(e) = self.slot_locks.release(lock.token).await {
            warn!("Failed to release slot lock {}: {}", lock.token, e);
            return;
        }
        self.publisher
            .publish(DomainEvent::SlotUnlocked {
                provider_id,
                slot_start: lock.slot_start,
            })
            .await;
    }

    pub(crate) fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    pub(crate) fn lifecycle(&self) -> &AppointmentLifecycleService {
        &self.lifecycle
    }

    async fn get_provider(
        &self,
        provider_id: Uuid,
        auth_token: &str,
    ) -> Result<Provider, SchedulingError> {
        let path = format!("/rest/v1/providers?id=eq.{}", provider_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(db_error)?;

        if result.is_empty() {
            return Err(SchedulingError::ProviderNotFound);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| SchedulingError::DatabaseError(format!("Failed to parse provider: {}", e)))
    }

    async fn insert_appointment(
        &self,
        request: &CreateAppointmentRequest,
        duration_minutes: i32,
        initial_status: AppointmentStatus,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        let ends_at = request.scheduled_at + ChronoDuration::minutes(duration_minutes as i64);
        let now = Utc::now();

        let appointment_data = json!({
            "provider_id": request.provider_id,
            "patient_id": request.patient_id,
            "scheduled_at": request.scheduled_at.to_rfc3339(),
            "ends_at": ends_at.to_rfc3339(),
            "duration_minutes": duration_minutes,
            "status": initial_status.to_string(),
            "reason": request.reason,
            "notes": request.notes,
            "proposal_state": "active",
            "version": Uuid::new_v4(),
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339()
        });

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let result: Result<Vec<Value>, DbError> = self
            .store
            .request_with_headers(
                Method::POST,
                "/rest/v1/appointments",
                Some(auth_token),
                Some(appointment_data),
                Some(headers),
            )
            .await;

        match result {
            Ok(rows) if rows.is_empty() => Err(SchedulingError::DatabaseError(
                "Appointment insert returned no row".to_string(),
            )),
            Ok(rows) => parse_appointment(rows[0].clone()),
            // The storage overlap constraint decided a concurrent race; the
            // losing write must surface as a conflict, never a partial write.
            Err(DbError::Conflict(detail)) => {
                warn!("Appointment insert lost the slot race: {}", detail);
                Err(SchedulingError::Conflict)
            }
            Err(e) => Err(db_error(e)),
        }
    }
}

fn parse_appointment(row: Value) -> Result<Appointment, SchedulingError> {
    serde_json::from_value(row)
        .map_err(|e| SchedulingError::DatabaseError(format!("Failed to parse appointment: {}", e)))
}

fn db_error(e: DbError) -> SchedulingError {
    match e {
        DbError::Conflict(_) => SchedulingError::Conflict,
        DbError::NotFound(_) => SchedulingError::NotFound,
        other => SchedulingError::DatabaseError(other.to_string()),
    }
}

fn agenda_error(e: AgendaError) -> SchedulingError {
    match e {
        AgendaError::ProviderNotFound => SchedulingError::ProviderNotFound,
        AgendaError::ValidationError(msg) => SchedulingError::ValidationError(msg),
        other => SchedulingError::DatabaseError(other.to_string()),
    }
}

pub(crate) fn requester_uuid(user: &User) -> Result<Uuid, SchedulingError> {
    Uuid::parse_str(&user.id)
        .map_err(|_| SchedulingError::ValidationError("Invalid requester identity".to_string()))
}
