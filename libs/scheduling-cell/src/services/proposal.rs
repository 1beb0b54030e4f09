// libs/scheduling-cell/src/services/proposal.rs
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::{AppConfig, RefusalPolicy};
use shared_models::auth::User;

use crate::models::{
    AcceptProposalRequest, Appointment, AppointmentStatus, CancelActor, ProposalState,
    ProposeRescheduleRequest, RefuseProposalRequest, SchedulingError,
};
use crate::services::booking::{requester_uuid, BookingService};
use crate::services::events::{DomainEvent, EventPublisher};

/// Negotiated reschedule between provider and patient.
///
/// A proposal never moves the appointment by itself: the original row is
/// retained until the patient accepts, and acceptance re-validates the
/// target slot exactly like a fresh booking.
pub struct ProposalService {
    booking: BookingService,
    refusal_policy: RefusalPolicy,
}

impl ProposalService {
    pub fn new(config: &AppConfig, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            booking: BookingService::new(config, publisher),
            refusal_policy: config.refusal_policy,
        }
    }

    /// Provider suggests an alternate time. The target slot is not required
    /// to be free yet; it is re-validated at acceptance.
    pub async fn propose(
        &self,
        appointment_id: Uuid,
        request: ProposeRescheduleRequest,
        requester: &User,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Proposing reschedule for appointment {}", appointment_id);

        let current = self.booking.get_appointment(appointment_id, auth_token).await?;

        if current.provider_id.to_string() != requester.id {
            return Err(SchedulingError::Unauthorized);
        }
        if !self.booking.lifecycle().can_propose_from(&current.status) {
            return Err(SchedulingError::InvalidStatusTransition(current.status));
        }
        self.booking
            .lifecycle()
            .validate_proposal_transition(&current.proposal_state, &ProposalState::Proposed)?;

        if request.proposed_at <= Utc::now() {
            return Err(SchedulingError::ValidationError(
                "Proposed time must be in the future".to_string(),
            ));
        }
        if let Some(minutes) = request.proposed_duration_minutes {
            if minutes <= 0 {
                return Err(SchedulingError::ValidationError(
                    "Proposed duration must be positive".to_string(),
                ));
            }
        }
        if current.version != request.version {
            return Err(SchedulingError::StaleVersion);
        }

        let mut update_data = serde_json::Map::new();
        update_data.insert(
            "proposal_state".to_string(),
            json!(ProposalState::Proposed.to_string()),
        );
        update_data.insert(
            "proposed_at".to_string(),
            json!(request.proposed_at.to_rfc3339()),
        );
        update_data.insert(
            "proposed_duration_minutes".to_string(),
            json!(request.proposed_duration_minutes),
        );
        update_data.insert("refusal_reason".to_string(), json!(null));

        let updated = self
            .booking
            .commit_update(appointment_id, request.version, update_data, auth_token)
            .await?;

        self.booking
            .publisher()
            .publish(DomainEvent::AppointmentUpdated {
                provider_id: updated.provider_id,
                appointment_id: updated.id,
                scheduled_at: updated.scheduled_at,
            })
            .await;

        info!(
            "Reschedule proposed for appointment {} to {}",
            appointment_id, request.proposed_at
        );
        Ok(updated)
    }

    /// Patient accepts: the target slot is validated and locked exactly like
    /// a fresh booking; on any failure the original appointment is left
    /// entirely unchanged.
    pub async fn accept(
        &self,
        appointment_id: Uuid,
        request: AcceptProposalRequest,
        requester: &User,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Accepting reschedule for appointment {}", appointment_id);

        let current = self.booking.get_appointment(appointment_id, auth_token).await?;

        if current.patient_id.to_string() != requester.id {
            return Err(SchedulingError::Unauthorized);
        }
        self.booking
            .lifecycle()
            .validate_proposal_transition(&current.proposal_state, &ProposalState::Accepted)?;

        let target = current.proposed_at.ok_or_else(|| {
            SchedulingError::ValidationError("No proposed time on record".to_string())
        })?;
        let duration = current
            .proposed_duration_minutes
            .unwrap_or(current.duration_minutes);

        if target <= Utc::now() {
            return Err(SchedulingError::ValidationError(
                "Proposed time has already passed".to_string(),
            ));
        }
        if current.version != request.version {
            return Err(SchedulingError::StaleVersion);
        }

        self.booking
            .validate_slot_in_availability(
                current.provider_id,
                target,
                Some(appointment_id),
                auth_token,
            )
            .await?;

        let holder_id = requester_uuid(requester)?;
        let lock = self
            .booking
            .acquire_slot_lock(current.provider_id, target, duration, holder_id)
            .await?;

        let ends_at = target + ChronoDuration::minutes(duration as i64);
        let overlap_check = self
            .booking
            .get_overlapping_appointments(
                current.provider_id,
                target,
                ends_at,
                Some(appointment_id),
                auth_token,
            )
            .await;

        let result = match overlap_check {
            Ok(existing) if !existing.is_empty() => {
                warn!(
                    "Proposed slot for appointment {} was taken in the interim",
                    appointment_id
                );
                Err(SchedulingError::Conflict)
            }
            Ok(_) => {
                let mut update_data = serde_json::Map::new();
                update_data.insert("scheduled_at".to_string(), json!(target.to_rfc3339()));
                update_data.insert("ends_at".to_string(), json!(ends_at.to_rfc3339()));
                update_data.insert("duration_minutes".to_string(), json!(duration));
                update_data.insert(
                    "status".to_string(),
                    json!(AppointmentStatus::Confirme.to_string()),
                );
                update_data.insert(
                    "proposal_state".to_string(),
                    json!(ProposalState::Accepted.to_string()),
                );
                update_data.insert("proposed_at".to_string(), json!(null));
                update_data.insert("proposed_duration_minutes".to_string(), json!(null));

                self.booking
                    .commit_update(appointment_id, request.version, update_data, auth_token)
                    .await
            }
            Err(e) => Err(e),
        };

        self.booking.release_lock(current.provider_id, &lock).await;

        let updated = result?;

        self.booking
            .publisher()
            .publish(DomainEvent::AppointmentUpdated {
                provider_id: updated.provider_id,
                appointment_id: updated.id,
                scheduled_at: updated.scheduled_at,
            })
            .await;
        for date in [
            current.scheduled_at.date_naive(),
            updated.scheduled_at.date_naive(),
        ] {
            self.booking
                .publisher()
                .publish(DomainEvent::SlotsUpdated {
                    provider_id: updated.provider_id,
                    date,
                })
                .await;
        }

        info!(
            "Reschedule accepted: appointment {} moved to {}",
            appointment_id, updated.scheduled_at
        );
        Ok(updated)
    }

    /// Patient refuses: proposed fields are cleared and the appointment
    /// either keeps its pre-proposal status or is cancelled, per policy.
    pub async fn refuse(
        &self,
        appointment_id: Uuid,
        request: RefuseProposalRequest,
        requester: &User,
        auth_token: &str,
    ) -> Result<Appointment, SchedulingError> {
        debug!("Refusing reschedule for appointment {}", appointment_id);

        let current = self.booking.get_appointment(appointment_id, auth_token).await?;

        if current.patient_id.to_string() != requester.id {
            return Err(SchedulingError::Unauthorized);
        }
        self.booking
            .lifecycle()
            .validate_proposal_transition(&current.proposal_state, &ProposalState::Refused)?;

        if current.version != request.version {
            return Err(SchedulingError::StaleVersion);
        }

        let mut update_data = serde_json::Map::new();
        update_data.insert(
            "proposal_state".to_string(),
            json!(ProposalState::Refused.to_string()),
        );
        update_data.insert("proposed_at".to_string(), json!(null));
        update_data.insert("proposed_duration_minutes".to_string(), json!(null));
        update_data.insert("refusal_reason".to_string(), json!(request.reason));

        let cancelled_by_policy = self.refusal_policy == RefusalPolicy::Cancel;
        if cancelled_by_policy {
            self.booking
                .lifecycle()
                .validate_status_transition(&current.status, &AppointmentStatus::Annule)?;
            update_data.insert(
                "status".to_string(),
                json!(AppointmentStatus::Annule.to_string()),
            );
            update_data.insert("cancelled_at".to_string(), json!(Utc::now().to_rfc3339()));
            update_data.insert(
                "cancelled_by".to_string(),
                json!(CancelActor::Patient.to_string()),
            );
            update_data.insert(
                "cancellation_reason".to_string(),
                json!(request
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Reschedule proposal refused".to_string())),
            );
        }

        let updated = self
            .booking
            .commit_update(appointment_id, request.version, update_data, auth_token)
            .await?;

        if cancelled_by_policy {
            self.booking
                .publisher()
                .publish(DomainEvent::AppointmentCancelled {
                    provider_id: updated.provider_id,
                    appointment_id: updated.id,
                    cancelled_by: CancelActor::Patient.to_string(),
                })
                .await;
            self.booking
                .publisher()
                .publish(DomainEvent::SlotsUpdated {
                    provider_id: updated.provider_id,
                    date: updated.scheduled_at.date_naive(),
                })
                .await;
        } else {
            self.booking
                .publisher()
                .publish(DomainEvent::AppointmentUpdated {
                    provider_id: updated.provider_id,
                    appointment_id: updated.id,
                    scheduled_at: updated.scheduled_at,
                })
                .await;
        }

        info!("Reschedule refused for appointment {}", appointment_id);
        Ok(updated)
    }
}
