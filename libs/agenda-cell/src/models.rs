// libs/agenda-cell/src/models.rs
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// PROVIDER AND AVAILABILITY MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub display_name: String,
    pub default_slot_minutes: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recurring weekly opening block. Several templates may target the same
/// weekday (split shifts); each contributes slots independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityTemplate {
    pub id: Uuid,
    pub provider_id: Uuid,
    /// ISO weekday, 1 = Monday .. 7 = Sunday.
    pub weekday: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_minutes: Option<i32>,
    pub active: bool,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilityTemplate {
    /// Whether this template applies on the given date.
    pub fn covers(&self, date: NaiveDate) -> bool {
        if !self.active {
            return false;
        }
        if let Some(from) = self.valid_from {
            if date < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if date > until {
                return false;
            }
        }
        true
    }
}

/// One-off closure overriding the weekly templates (vacation, sick day,
/// training). A non-full-day exception carries its own time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailabilityException {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub full_day: bool,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UnavailabilityException {
    pub fn covers_date(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// Minimal appointment projection the composer needs; the full model lives
/// in the scheduling cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookedAppointment {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub patient_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: String,
    pub reason: Option<String>,
}

// ==============================================================================
// COMPOSED SCHEDULE PROJECTION
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Occupied,
    Unavailable,
    Past,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotStatus::Available => write!(f, "available"),
            SlotStatus::Occupied => write!(f, "occupied"),
            SlotStatus::Unavailable => write!(f, "unavailable"),
            SlotStatus::Past => write!(f, "past"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: SlotStatus,
    /// Occupying appointment, when status is `occupied`.
    pub appointment_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    /// Exception reason or appointment motive, depending on status.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplateRequest {
    pub provider_id: Uuid,
    pub weekday: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_minutes: Option<i32>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTemplateRequest {
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub slot_minutes: Option<i32>,
    pub active: Option<bool>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExceptionRequest {
    pub provider_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub full_day: bool,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub reason: Option<String>,
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgendaError {
    #[error("Provider not found")]
    ProviderNotFound,

    #[error("Availability template not found")]
    TemplateNotFound,

    #[error("Unavailability exception not found")]
    ExceptionNotFound,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Template conflicts with an existing schedule")]
    TemplateOverlap,

    #[error("Database error: {0}")]
    DatabaseError(String),
}
