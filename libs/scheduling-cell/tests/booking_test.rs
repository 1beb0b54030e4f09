// libs/scheduling-cell/tests/booking_test.rs
//
// Booking engine against a mock PostgREST store. Storage-level constraint
// outcomes (unique violation, CAS filter misses) are simulated with 409 and
// empty PATCH results.

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scheduling_cell::models::{
    AppointmentStatus, CancelActor, CancelAppointmentRequest, CreateAppointmentRequest,
    SchedulingError, UpdateAppointmentRequest,
};
use scheduling_cell::services::booking::BookingService;
use scheduling_cell::services::events::{BroadcastEventPublisher, EventPublisher};
use shared_models::auth::User;
use shared_utils::test_utils::{MockStoreResponses, TestConfig, TestUser};

struct TestSetup {
    service: BookingService,
    events: Arc<BroadcastEventPublisher>,
    mock_server: MockServer,
    provider_id: Uuid,
    patient: TestUser,
    auth_token: String,
}

impl TestSetup {
    async fn new() -> Self {
        let mock_server = MockServer::start().await;
        let config = TestConfig::with_store_url(&mock_server.uri()).to_app_config();
        let events = Arc::new(BroadcastEventPublisher::new());
        let publisher: Arc<dyn EventPublisher> = events.clone();

        Self {
            service: BookingService::new(&config, publisher),
            events,
            mock_server,
            provider_id: Uuid::new_v4(),
            patient: TestUser::patient("patient@example.com"),
            auth_token: "test_token".to_string(),
        }
    }

    fn patient_user(&self) -> User {
        self.patient.to_user()
    }

    fn patient_uuid(&self) -> Uuid {
        Uuid::parse_str(&self.patient.id).unwrap()
    }

    /// Store fixtures for a bookable Monday morning: provider, one weekly
    /// template and an empty agenda.
    async fn mock_open_monday(&self) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/providers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![
                MockStoreResponses::provider_row(self.provider_id),
            ]))
            .mount(&self.mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/availability_templates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![
                MockStoreResponses::template_row(
                    self.provider_id,
                    1,
                    "08:00:00",
                    "10:00:00",
                    Some(30),
                ),
            ]))
            .mount(&self.mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/unavailability_exceptions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()),
            )
            .mount(&self.mock_server)
            .await;
    }

    async fn mock_free_locks(&self) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/slot_locks"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()),
            )
            .mount(&self.mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/slot_locks"))
            .respond_with(ResponseTemplate::new(201).set_body_json(vec![json!({
                "id": Uuid::new_v4(),
                "provider_id": self.provider_id,
                "slot_start": "2030-05-06T08:00:00+00:00",
                "duration_minutes": 30,
                "holder_id": self.patient_uuid(),
                "token": Uuid::new_v4(),
                "expires_at": (Utc::now() + Duration::minutes(5)).to_rfc3339(),
                "created_at": Utc::now().to_rfc3339()
            })]))
            .mount(&self.mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/slot_locks"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()),
            )
            .mount(&self.mock_server)
            .await;
    }
}

fn create_request(setup: &TestSetup) -> CreateAppointmentRequest {
    CreateAppointmentRequest {
        provider_id: setup.provider_id,
        patient_id: setup.patient_uuid(),
        scheduled_at: "2030-05-06T08:00:00Z".parse().unwrap(),
        duration_minutes: Some(30),
        reason: Some("Consultation".to_string()),
        notes: None,
    }
}

fn appointment_row(
    id: Uuid,
    provider_id: Uuid,
    patient_id: Uuid,
    status: &str,
    version: Uuid,
) -> serde_json::Value {
    json!({
        "id": id,
        "provider_id": provider_id,
        "patient_id": patient_id,
        "scheduled_at": "2030-05-06T08:00:00+00:00",
        "ends_at": "2030-05-06T08:30:00+00:00",
        "duration_minutes": 30,
        "status": status,
        "reason": "Consultation",
        "notes": null,
        "cancelled_at": null,
        "cancelled_by": null,
        "cancellation_reason": null,
        "proposal_state": "active",
        "proposed_at": null,
        "proposed_duration_minutes": null,
        "refusal_reason": null,
        "version": version,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z"
    })
}

#[tokio::test]
async fn patient_booking_creates_planned_appointment_and_emits_events() {
    let setup = TestSetup::new().await;
    setup.mock_open_monday().await;
    setup.mock_free_locks().await;

    // Empty agenda for both the composer pass and the write-time re-check.
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(vec![appointment_row(
            Uuid::new_v4(),
            setup.provider_id,
            setup.patient_uuid(),
            "planifie",
            Uuid::new_v4(),
        )]))
        .mount(&setup.mock_server)
        .await;

    let mut receiver = setup.events.subscribe(setup.provider_id).await;

    let appointment = setup
        .service
        .create_appointment(create_request(&setup), &setup.patient_user(), &setup.auth_token)
        .await
        .expect("booking should succeed");

    assert_eq!(appointment.status, AppointmentStatus::Planifie);
    assert_eq!(appointment.patient_id, setup.patient_uuid());

    // Lock, unlock, creation and grid refresh all reach the realtime boundary.
    let mut seen = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        seen.push(message);
    }
    assert!(seen.iter().any(|m| m.contains("slot_locked")));
    assert!(seen.iter().any(|m| m.contains("slot_unlocked")));
    assert!(seen.iter().any(|m| m.contains("appointment_created")));
    assert!(seen.iter().any(|m| m.contains("slots_updated")));
}

#[tokio::test]
async fn staff_booking_is_created_confirmed() {
    let setup = TestSetup::new().await;
    setup.mock_open_monday().await;
    setup.mock_free_locks().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(vec![appointment_row(
            Uuid::new_v4(),
            setup.provider_id,
            setup.patient_uuid(),
            "confirme",
            Uuid::new_v4(),
        )]))
        .mount(&setup.mock_server)
        .await;

    let staff = TestUser::staff("staff@example.com").to_user();
    let appointment = setup
        .service
        .create_appointment(create_request(&setup), &staff, &setup.auth_token)
        .await
        .expect("booking should succeed");

    assert_eq!(appointment.status, AppointmentStatus::Confirme);
}

#[tokio::test]
async fn occupied_slot_is_rejected_before_locking() {
    let setup = TestSetup::new().await;
    setup.mock_open_monday().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![appointment_row(
            Uuid::new_v4(),
            setup.provider_id,
            Uuid::new_v4(),
            "confirme",
            Uuid::new_v4(),
        )]))
        .mount(&setup.mock_server)
        .await;
    // Availability is validated before any lock is taken.
    Mock::given(method("POST"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&setup.mock_server)
        .await;

    let result = setup
        .service
        .create_appointment(create_request(&setup), &setup.patient_user(), &setup.auth_token)
        .await;

    assert_matches!(result, Err(SchedulingError::Conflict));
}

#[tokio::test]
async fn losing_the_write_race_returns_conflict() {
    let setup = TestSetup::new().await;
    setup.mock_open_monday().await;
    setup.mock_free_locks().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;
    // The competing request committed first: the storage overlap constraint
    // rejects this insert.
    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(409).set_body_string("overlap constraint"))
        .mount(&setup.mock_server)
        .await;

    let result = setup
        .service
        .create_appointment(create_request(&setup), &setup.patient_user(), &setup.auth_token)
        .await;

    assert_matches!(result, Err(SchedulingError::Conflict));
}

#[tokio::test]
async fn off_template_time_is_not_bookable() {
    let setup = TestSetup::new().await;
    setup.mock_open_monday().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;

    let mut request = create_request(&setup);
    request.scheduled_at = "2030-05-06T14:00:00Z".parse().unwrap();

    let result = setup
        .service
        .create_appointment(request, &setup.patient_user(), &setup.auth_token)
        .await;

    assert_matches!(result, Err(SchedulingError::SlotUnavailable));
}

#[tokio::test]
async fn stale_token_update_is_rejected() {
    let setup = TestSetup::new().await;
    let appointment_id = Uuid::new_v4();
    let stored_version = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![appointment_row(
            appointment_id,
            setup.provider_id,
            setup.patient_uuid(),
            "planifie",
            stored_version,
        )]))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&setup.mock_server)
        .await;

    let request = UpdateAppointmentRequest {
        version: Uuid::new_v4(), // captured before someone else's write
        scheduled_at: None,
        duration_minutes: None,
        reason: None,
        notes: Some("updated notes".to_string()),
    };

    let result = setup
        .service
        .update_appointment(appointment_id, request, &setup.auth_token)
        .await;

    assert_matches!(result, Err(SchedulingError::StaleVersion));
}

#[tokio::test]
async fn cas_filter_miss_surfaces_as_stale_version() {
    let setup = TestSetup::new().await;
    let appointment_id = Uuid::new_v4();
    let stored_version = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![appointment_row(
            appointment_id,
            setup.provider_id,
            setup.patient_uuid(),
            "planifie",
            stored_version,
        )]))
        .mount(&setup.mock_server)
        .await;
    // A concurrent commit rotated the version between our read and write:
    // the filtered PATCH matches no row.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;

    let request = UpdateAppointmentRequest {
        version: stored_version,
        scheduled_at: None,
        duration_minutes: None,
        reason: None,
        notes: Some("updated notes".to_string()),
    };

    let result = setup
        .service
        .update_appointment(appointment_id, request, &setup.auth_token)
        .await;

    assert_matches!(result, Err(SchedulingError::StaleVersion));
}

#[tokio::test]
async fn cancellation_records_audit_fields() {
    let setup = TestSetup::new().await;
    let appointment_id = Uuid::new_v4();
    let stored_version = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![appointment_row(
            appointment_id,
            setup.provider_id,
            setup.patient_uuid(),
            "planifie",
            stored_version,
        )]))
        .mount(&setup.mock_server)
        .await;

    let mut cancelled_row = appointment_row(
        appointment_id,
        setup.provider_id,
        setup.patient_uuid(),
        "annule",
        Uuid::new_v4(),
    );
    cancelled_row["cancelled_at"] = json!(Utc::now().to_rfc3339());
    cancelled_row["cancelled_by"] = json!("patient");
    cancelled_row["cancellation_reason"] = json!("Family emergency");
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![cancelled_row]))
        .mount(&setup.mock_server)
        .await;

    let cancelled = setup
        .service
        .cancel_appointment(
            appointment_id,
            CancelAppointmentRequest {
                version: stored_version,
                reason: "Family emergency".to_string(),
            },
            CancelActor::Patient,
            &setup.auth_token,
        )
        .await
        .expect("cancellation should succeed");

    assert_eq!(cancelled.status, AppointmentStatus::Annule);
    assert_eq!(cancelled.cancelled_by, Some(CancelActor::Patient));
    assert!(cancelled.cancelled_at.is_some());
}

#[tokio::test]
async fn second_cancellation_never_reapplies_audit_fields() {
    let setup = TestSetup::new().await;
    let appointment_id = Uuid::new_v4();

    let mut row = appointment_row(
        appointment_id,
        setup.provider_id,
        setup.patient_uuid(),
        "annule",
        Uuid::new_v4(),
    );
    row["cancelled_at"] = json!("2024-06-01T10:00:00Z");
    row["cancelled_by"] = json!("patient");
    row["cancellation_reason"] = json!("Original reason");

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![row]))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&setup.mock_server)
        .await;

    let result = setup
        .service
        .cancel_appointment(
            appointment_id,
            CancelAppointmentRequest {
                version: Uuid::new_v4(),
                reason: "Trying again".to_string(),
            },
            CancelActor::Patient,
            &setup.auth_token,
        )
        .await;

    assert_matches!(result, Err(SchedulingError::AlreadyCancelled));
}

#[tokio::test]
async fn completing_an_unstarted_visit_is_a_domain_error() {
    let setup = TestSetup::new().await;
    let appointment_id = Uuid::new_v4();
    let stored_version = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![appointment_row(
            appointment_id,
            setup.provider_id,
            setup.patient_uuid(),
            "confirme",
            stored_version,
        )]))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&setup.mock_server)
        .await;

    let result = setup
        .service
        .transition_status(
            appointment_id,
            AppointmentStatus::Termine,
            stored_version,
            &setup.auth_token,
        )
        .await;

    assert_matches!(
        result,
        Err(SchedulingError::InvalidStatusTransition(
            AppointmentStatus::Confirme
        ))
    );
}
