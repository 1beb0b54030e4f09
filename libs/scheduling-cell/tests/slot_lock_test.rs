// libs/scheduling-cell/tests/slot_lock_test.rs
//
// Slot lock manager against a mock PostgREST store: the storage uniqueness
// constraint is simulated with 409 responses.

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scheduling_cell::models::SchedulingError;
use scheduling_cell::services::slot_lock::SlotLockService;
use shared_database::PostgrestClient;
use shared_utils::test_utils::TestConfig;

struct TestSetup {
    service: SlotLockService,
    mock_server: MockServer,
    provider_id: Uuid,
    holder_id: Uuid,
}

impl TestSetup {
    async fn new() -> Self {
        let mock_server = MockServer::start().await;
        let config = TestConfig::with_store_url(&mock_server.uri()).to_app_config();
        let store = Arc::new(PostgrestClient::new(&config));

        Self {
            service: SlotLockService::new(store, 5),
            mock_server,
            provider_id: Uuid::new_v4(),
            holder_id: Uuid::new_v4(),
        }
    }
}

fn slot_start() -> DateTime<Utc> {
    "2030-05-06T09:00:00Z".parse().unwrap()
}

fn lock_row(
    provider_id: Uuid,
    start: DateTime<Utc>,
    holder_id: Uuid,
    expires_at: DateTime<Utc>,
) -> serde_json::Value {
    json!({
        "id": Uuid::new_v4(),
        "provider_id": provider_id,
        "slot_start": start.to_rfc3339(),
        "duration_minutes": 30,
        "holder_id": holder_id,
        "token": Uuid::new_v4(),
        "expires_at": expires_at.to_rfc3339(),
        "created_at": Utc::now().to_rfc3339()
    })
}

#[tokio::test]
async fn acquire_succeeds_on_free_slot() {
    let setup = TestSetup::new().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(201).set_body_json(vec![lock_row(
            setup.provider_id,
            slot_start(),
            setup.holder_id,
            Utc::now() + Duration::minutes(5),
        )]))
        .mount(&setup.mock_server)
        .await;

    let lock = setup
        .service
        .acquire(setup.provider_id, slot_start(), 30, setup.holder_id)
        .await
        .expect("acquisition should succeed");

    assert_eq!(lock.provider_id, setup.provider_id);
    assert_eq!(lock.holder_id, setup.holder_id);
    assert!(lock.expires_at > Utc::now());
}

#[tokio::test]
async fn acquire_conflicts_when_other_holder_has_unexpired_lock() {
    let setup = TestSetup::new().await;
    let other_holder = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![lock_row(
            setup.provider_id,
            slot_start(),
            other_holder,
            Utc::now() + Duration::minutes(4),
        )]))
        .mount(&setup.mock_server)
        .await;
    // No insert may be attempted once the pre-scan sees the live lock.
    Mock::given(method("POST"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&setup.mock_server)
        .await;

    let result = setup
        .service
        .acquire(setup.provider_id, slot_start(), 30, setup.holder_id)
        .await;

    assert_matches!(result, Err(SchedulingError::Conflict));
}

#[tokio::test]
async fn overlapping_window_blocks_even_with_different_start() {
    let setup = TestSetup::new().await;
    let other_holder = Uuid::new_v4();

    // A 30-minute lock starting 15 minutes before the requested slot.
    Mock::given(method("GET"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![lock_row(
            setup.provider_id,
            slot_start() - Duration::minutes(15),
            other_holder,
            Utc::now() + Duration::minutes(4),
        )]))
        .mount(&setup.mock_server)
        .await;

    let result = setup
        .service
        .acquire(setup.provider_id, slot_start(), 30, setup.holder_id)
        .await;

    assert_matches!(result, Err(SchedulingError::Conflict));
}

#[tokio::test]
async fn expired_lock_is_swept_and_acquisition_succeeds() {
    let setup = TestSetup::new().await;
    let other_holder = Uuid::new_v4();
    let expired = lock_row(
        setup.provider_id,
        slot_start(),
        other_holder,
        Utc::now() - Duration::minutes(1),
    );

    // The stale row is still in the store; every reader must treat it as
    // absent.
    Mock::given(method("GET"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![expired]))
        .mount(&setup.mock_server)
        .await;
    // First insert trips the uniqueness constraint on the stale row.
    Mock::given(method("POST"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
        .up_to_n_times(1)
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;
    // Retry after the sweep wins the row.
    Mock::given(method("POST"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(201).set_body_json(vec![lock_row(
            setup.provider_id,
            slot_start(),
            setup.holder_id,
            Utc::now() + Duration::minutes(5),
        )]))
        .mount(&setup.mock_server)
        .await;

    let lock = setup
        .service
        .acquire(setup.provider_id, slot_start(), 30, setup.holder_id)
        .await
        .expect("acquisition should succeed after sweeping the expired lock");

    assert_eq!(lock.holder_id, setup.holder_id);
}

#[tokio::test]
async fn same_holder_refreshes_instead_of_conflicting() {
    let setup = TestSetup::new().await;
    let own_lock = lock_row(
        setup.provider_id,
        slot_start(),
        setup.holder_id,
        Utc::now() + Duration::minutes(2),
    );

    Mock::given(method("GET"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![own_lock.clone()]))
        .mount(&setup.mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
        .mount(&setup.mock_server)
        .await;

    let mut refreshed = own_lock.clone();
    refreshed["expires_at"] = json!((Utc::now() + Duration::minutes(5)).to_rfc3339());
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![refreshed]))
        .mount(&setup.mock_server)
        .await;

    let lock = setup
        .service
        .acquire(setup.provider_id, slot_start(), 30, setup.holder_id)
        .await
        .expect("own lock should be refreshed");

    assert_eq!(lock.holder_id, setup.holder_id);
    assert!(lock.expires_at > Utc::now() + Duration::minutes(4));
}

#[tokio::test]
async fn release_of_unknown_token_is_a_no_op() {
    let setup = TestSetup::new().await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
        .mount(&setup.mock_server)
        .await;

    let result = setup.service.release(Uuid::new_v4()).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn cleanup_reports_number_of_swept_locks() {
    let setup = TestSetup::new().await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![
            lock_row(
                setup.provider_id,
                slot_start(),
                setup.holder_id,
                Utc::now() - Duration::minutes(10),
            ),
            lock_row(
                setup.provider_id,
                slot_start() + Duration::minutes(30),
                setup.holder_id,
                Utc::now() - Duration::minutes(3),
            ),
        ]))
        .mount(&setup.mock_server)
        .await;

    let cleaned = setup
        .service
        .cleanup_expired()
        .await
        .expect("cleanup should succeed");
    assert_eq!(cleaned, 2);
}
