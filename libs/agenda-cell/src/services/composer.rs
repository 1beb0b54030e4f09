// libs/agenda-cell/src/services/composer.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::PostgrestClient;

use crate::models::{
    AgendaError, AvailabilityTemplate, BookedAppointment, DaySchedule, Provider, Slot,
    SlotStatus, UnavailabilityException,
};

/// Derives the bookable slot grid for a provider over a date range from
/// weekly templates, unavailability exceptions and existing bookings.
///
/// Pure read-side projection: performs no writes and is safe to call with
/// arbitrary concurrency.
pub struct ScheduleComposer {
    store: PostgrestClient,
    max_range_days: i64,
}

impl ScheduleComposer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            store: PostgrestClient::new(config),
            max_range_days: config.max_schedule_range_days,
        }
    }

    /// Compose the per-day schedule for `[from, to]` (inclusive).
    pub async fn compose(
        &self,
        provider_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        auth_token: &str,
    ) -> Result<Vec<DaySchedule>, AgendaError> {
        if to < from {
            return Err(AgendaError::ValidationError(
                "End date must not be before start date".to_string(),
            ));
        }
        let range_days = (to - from).num_days() + 1;
        if range_days > self.max_range_days {
            return Err(AgendaError::ValidationError(format!(
                "Date range cannot exceed {} days",
                self.max_range_days
            )));
        }

        debug!(
            "Composing schedule for provider {} from {} to {}",
            provider_id, from, to
        );

        let provider = self.get_provider(provider_id, auth_token).await?;
        let templates = self.get_templates(provider_id, auth_token).await?;
        let exceptions = self.get_exceptions(provider_id, from, to, auth_token).await?;
        let appointments = self
            .get_booked_appointments(provider_id, from, to, auth_token)
            .await?;

        let now = Utc::now();
        let mut days = Vec::with_capacity(range_days as usize);
        let mut date = from;
        while date <= to {
            days.push(compose_day(
                date,
                &provider,
                &templates,
                &exceptions,
                &appointments,
                now,
            ));
            date = date + Duration::days(1);
        }

        Ok(days)
    }

    // ==========================================================================
    // STORE ACCESS
    // ==========================================================================

    async fn get_provider(
        &self,
        provider_id: Uuid,
        auth_token: &str,
    ) -> Result<Provider, AgendaError> {
        let path = format!("/rest/v1/providers?id=eq.{}", provider_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        if result.is_empty() {
            return Err(AgendaError::ProviderNotFound);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse provider: {}", e)))
    }

    async fn get_templates(
        &self,
        provider_id: Uuid,
        auth_token: &str,
    ) -> Result<Vec<AvailabilityTemplate>, AgendaError> {
        let path = format!(
            "/rest/v1/availability_templates?provider_id=eq.{}&active=eq.true&order=weekday.asc,start_time.asc",
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

    async fn get_exceptions(
        &self,
        provider_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        auth_token: &str,
    ) -> Result<Vec<UnavailabilityException>, AgendaError> {
        let path = format!(
            "/rest/v1/unavailability_exceptions?provider_id=eq.{}&start_date=lte.{}&end_date=gte.{}",
            provider_id, to, from
        );
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<UnavailabilityException>, _>>()
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse exceptions: {}", e)))
    }

    async fn get_booked_appointments(
        &self,
        provider_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        auth_token: &str,
    ) -> Result<Vec<BookedAppointment>, AgendaError> {
        let range_start = from
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .ok_or_else(|| AgendaError::ValidationError("Invalid start date".to_string()))?;
        let range_end = to
            .and_hms_opt(23, 59, 59)
            .map(|t| t.and_utc())
            .ok_or_else(|| AgendaError::ValidationError("Invalid end date".to_string()))?;

        let path = format!(
            "/rest/v1/appointments?provider_id=eq.{}&status=neq.annule&scheduled_at=gte.{}&scheduled_at=lte.{}&order=scheduled_at.asc",
            provider_id,
            urlencoding::encode(&range_start.to_rfc3339()),
            urlencoding::encode(&range_end.to_rfc3339())
        );
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AgendaError::DatabaseError(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<BookedAppointment>, _>>()
            .map_err(|e| AgendaError::DatabaseError(format!("Failed to parse appointments: {}", e)))
    }
}

/// ISO weekday for a date, 1 = Monday .. 7 = Sunday.
fn iso_weekday(date: NaiveDate) -> i16 {
    date.weekday().number_from_monday() as i16
}

/// Build the schedule for a single date. Pure; all inputs are prefetched.
fn compose_day(
    date: NaiveDate,
    provider: &Provider,
    templates: &[AvailabilityTemplate],
    exceptions: &[UnavailabilityException],
    appointments: &[BookedAppointment],
    now: DateTime<Utc>,
) -> DaySchedule {
    let weekday = iso_weekday(date);

    let full_day_exception = exceptions
        .iter()
        .find(|e| e.full_day && e.covers_date(date));

    let day_appointments: Vec<&BookedAppointment> = appointments
        .iter()
        .filter(|a| a.status != "annule" && a.scheduled_at.date_naive() == date)
        .collect();

    // Keyed by start time so identical starts collapse to one entry.
    let mut grid: BTreeMap<DateTime<Utc>, Slot> = BTreeMap::new();

    for template in templates.iter().filter(|t| t.weekday == weekday && t.covers(date)) {
        let slot_minutes = effective_slot_minutes(template, provider);
        if slot_minutes <= 0 {
            continue;
        }
        let step = Duration::minutes(slot_minutes as i64);

        let block_start = date.and_time(template.start_time).and_utc();
        let block_end = date.and_time(template.end_time).and_utc();

        let mut cursor = block_start;
        while cursor + step <= block_end {
            let slot_end = cursor + step;
            let slot = classify_slot(
                cursor,
                slot_end,
                slot_minutes,
                full_day_exception,
                &day_appointments,
                now,
            );
            merge_slot(&mut grid, slot);
            cursor = slot_end;
        }
    }

    // Bookings that no longer line up with a generated slot (template later
    // changed or disabled) still block their window.
    for appointment in &day_appointments {
        if !grid.contains_key(&appointment.scheduled_at) {
            grid.insert(
                appointment.scheduled_at,
                occupied_slot(appointment.scheduled_at, appointment),
            );
        }
    }

    DaySchedule {
        date,
        slots: grid.into_values().collect(),
    }
}

fn effective_slot_minutes(template: &AvailabilityTemplate, provider: &Provider) -> i32 {
    template
        .slot_minutes
        .filter(|m| *m > 0)
        .unwrap_or(if provider.default_slot_minutes > 0 {
            provider.default_slot_minutes
        } else {
            30
        })
}

fn classify_slot(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    duration_minutes: i32,
    full_day_exception: Option<&UnavailabilityException>,
    day_appointments: &[&BookedAppointment],
    now: DateTime<Utc>,
) -> Slot {
    if start <= now {
        return Slot {
            start_time: start,
            end_time: end,
            duration_minutes,
            status: SlotStatus::Past,
            appointment_id: None,
            patient_id: None,
            detail: None,
        };
    }

    if let Some(exception) = full_day_exception {
        return Slot {
            start_time: start,
            end_time: end,
            duration_minutes,
            status: SlotStatus::Unavailable,
            appointment_id: None,
            patient_id: None,
            detail: exception.reason.clone(),
        };
    }

    if let Some(appointment) = day_appointments
        .iter()
        .find(|a| start < a.ends_at && a.scheduled_at < end)
    {
        return occupied_at(start, end, duration_minutes, appointment);
    }

    Slot {
        start_time: start,
        end_time: end,
        duration_minutes,
        status: SlotStatus::Available,
        appointment_id: None,
        patient_id: None,
        detail: None,
    }
}

fn occupied_at(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    duration_minutes: i32,
    appointment: &BookedAppointment,
) -> Slot {
    Slot {
        start_time: start,
        end_time: end,
        duration_minutes,
        status: SlotStatus::Occupied,
        appointment_id: Some(appointment.id),
        patient_id: Some(appointment.patient_id),
        detail: appointment.reason.clone(),
    }
}

fn occupied_slot(start: DateTime<Utc>, appointment: &BookedAppointment) -> Slot {
    occupied_at(
        start,
        appointment.ends_at,
        appointment.duration_minutes,
        appointment,
    )
}

/// Identical start times collapse to one entry; an occupied entry wins over
/// an available one from an overlapping template.
fn merge_slot(grid: &mut BTreeMap<DateTime<Utc>, Slot>, slot: Slot) {
    match grid.get(&slot.start_time) {
        Some(existing)
            if existing.status == SlotStatus::Available
                && slot.status == SlotStatus::Occupied =>
        {
            grid.insert(slot.start_time, slot);
        }
        Some(_) => {}
        None => {
            grid.insert(slot.start_time, slot);
        }
    }
}
