// libs/scheduling-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub patient_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<CancelActor>,
    pub cancellation_reason: Option<String>,
    pub proposal_state: ProposalState,
    pub proposed_at: Option<DateTime<Utc>>,
    pub proposed_duration_minutes: Option<i32>,
    pub refusal_reason: Option<String>,
    /// Opaque concurrency token, regenerated on every committed write.
    pub version: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn scheduled_end_time(&self) -> DateTime<Utc> {
        self.scheduled_at + chrono::Duration::minutes(self.duration_minutes as i64)
    }

    /// Whether this appointment still blocks its time window.
    pub fn occupies_slot(&self) -> bool {
        self.status != AppointmentStatus::Annule
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Planifie,
    Confirme,
    EnCours,
    Termine,
    Annule,
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Planifie => write!(f, "planifie"),
            AppointmentStatus::Confirme => write!(f, "confirme"),
            AppointmentStatus::EnCours => write!(f, "en_cours"),
            AppointmentStatus::Termine => write!(f, "termine"),
            AppointmentStatus::Annule => write!(f, "annule"),
        }
    }
}

/// Negotiation state of a provider-initiated reschedule proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Active,
    Proposed,
    Accepted,
    Refused,
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalState::Active => write!(f, "active"),
            ProposalState::Proposed => write!(f, "proposed"),
            ProposalState::Accepted => write!(f, "accepted"),
            ProposalState::Refused => write!(f, "refused"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelActor {
    Patient,
    Provider,
    Staff,
}

impl fmt::Display for CancelActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelActor::Patient => write!(f, "patient"),
            CancelActor::Provider => write!(f, "provider"),
            CancelActor::Staff => write!(f, "staff"),
        }
    }
}

// ==============================================================================
// SLOT LOCK MODELS
// ==============================================================================

/// Short-lived persisted exclusivity marker on a (provider, time) pair.
/// Advisory only: it narrows the booking race window but the write-time
/// overlap check remains authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotLock {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub slot_start: DateTime<Utc>,
    pub duration_minutes: i32,
    pub holder_id: Uuid,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SlotLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.slot_start + chrono::Duration::minutes(self.duration_minutes as i64)
    }
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    pub provider_id: Uuid,
    pub patient_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: Option<i32>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAppointmentRequest {
    /// Concurrency token captured at last read; a stale value is a conflict.
    pub version: Uuid,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub version: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub version: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRescheduleRequest {
    pub version: Uuid,
    pub proposed_at: DateTime<Utc>,
    pub proposed_duration_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptProposalRequest {
    pub version: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefuseProposalRequest {
    pub version: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentSearchQuery {
    pub patient_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum SchedulingError {
    #[error("Appointment not found")]
    NotFound,

    #[error("Provider not found")]
    ProviderNotFound,

    #[error("Requested slot is not available")]
    SlotUnavailable,

    #[error("Appointment conflicts with an existing booking")]
    Conflict,

    #[error("Concurrency token is stale; reload and retry")]
    StaleVersion,

    #[error("Appointment is already cancelled")]
    AlreadyCancelled,

    #[error("Appointment cannot change from status {0}")]
    InvalidStatusTransition(AppointmentStatus),

    #[error("Reschedule proposal cannot change from state {0}")]
    InvalidProposalTransition(ProposalState),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized access to appointment")]
    Unauthorized,

    #[error("Database error: {0}")]
    DatabaseError(String),
}
