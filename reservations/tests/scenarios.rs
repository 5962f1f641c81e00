//! End-to-end command scenarios against the in-memory event store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::NaiveDate;
use medtour_core::event_store::EventStore;
use medtour_core::stream::{AggregateId, Version};
use medtour_reservations::aggregate::ReservationEvent;
use medtour_reservations::numbering::ReservationNumberAllocator;
use medtour_reservations::{
    CommandReceipt, CreateReservation, Reservation, ReservationService, ReservationStatus, ServiceError,
};
use medtour_runtime::{CommandDispatcher, RetryPolicy};
use medtour_testing::{FixedClock, InMemoryEventStore, LockstepEventStore, RecordingEventBus, test_clock};
use std::sync::Arc;

fn service_on(store: Arc<dyn EventStore>, clock: &FixedClock, policy: RetryPolicy) -> ReservationService {
    let clock = Arc::new(clock.clone());
    let dispatcher =
        CommandDispatcher::<Reservation>::new(Arc::clone(&store), Arc::new(RecordingEventBus::new()), clock.clone())
            .with_conflict_policy(policy);
    let numbers = Arc::new(ReservationNumberAllocator::new(store, clock.clone()));
    ReservationService::new(dispatcher, numbers, clock)
}

fn request() -> CreateReservation {
    CreateReservation {
        user_id: "patient-17".to_string(),
        hospital_id: "seoul-central".to_string(),
        procedure_type: "mri".to_string(),
        reservation_date: NaiveDate::from_ymd_opt(2025, 2, 14).unwrap(),
    }
}

async fn created(service: &ReservationService) -> CommandReceipt {
    service.create(request()).await.unwrap()
}

#[tokio::test]
async fn create_starts_pending_at_version_one() {
    let store = Arc::new(InMemoryEventStore::new());
    let service = service_on(store.clone(), &test_clock(), RetryPolicy::no_retry());

    let receipt = created(&service).await;

    assert_eq!(receipt.version, Version::new(1));
    assert_eq!(receipt.status, ReservationStatus::Pending);
    assert_eq!(
        receipt.reservation_number.as_ref().map(|n| n.as_str()),
        Some("RSV-202501-00001")
    );

    let history = store
        .load_events(receipt.reservation_id.clone(), None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, ReservationEvent::CREATED);
}

#[tokio::test]
async fn confirm_moves_to_version_two() {
    let service = service_on(Arc::new(InMemoryEventStore::new()), &test_clock(), RetryPolicy::no_retry());
    let id = created(&service).await.reservation_id;

    let receipt = service.confirm(id.as_str(), "coordinator-3").await.unwrap();

    assert_eq!(receipt.version, Version::new(2));
    assert_eq!(receipt.status, ReservationStatus::Confirmed);
    let (state, version) = service.load(&id).await.unwrap();
    assert_eq!(version, Version::new(2));
    assert_eq!(state.confirmed_by.as_deref(), Some("coordinator-3"));
}

#[tokio::test]
async fn cancel_after_confirm_reaches_version_three() {
    let service = service_on(Arc::new(InMemoryEventStore::new()), &test_clock(), RetryPolicy::no_retry());
    let id = created(&service).await.reservation_id;
    service.confirm(id.as_str(), "coordinator-3").await.unwrap();

    let receipt = service.cancel(id.as_str(), "flight cancelled").await.unwrap();

    assert_eq!(receipt.version, Version::new(3));
    assert_eq!(receipt.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn second_cancel_is_rejected_and_version_stays() {
    let service = service_on(Arc::new(InMemoryEventStore::new()), &test_clock(), RetryPolicy::no_retry());
    let id = created(&service).await.reservation_id;
    service.confirm(id.as_str(), "coordinator-3").await.unwrap();
    service.cancel(id.as_str(), "flight cancelled").await.unwrap();

    let err = service.cancel(id.as_str(), "again").await.unwrap_err();

    assert!(matches!(
        err,
        ServiceError::InvalidTransition {
            command: "cancel",
            state: "CANCELLED"
        }
    ));
    assert_eq!(service.load(&id).await.unwrap().1, Version::new(3));
}

#[tokio::test]
async fn racing_confirms_without_retry_yield_one_conflict() {
    let inner: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let clock = test_clock();
    let id = created(&service_on(inner.clone(), &clock, RetryPolicy::no_retry()))
        .await
        .reservation_id;

    let racing = service_on(
        Arc::new(LockstepEventStore::new(inner.clone(), 2)),
        &clock,
        RetryPolicy::no_retry(),
    );
    let (left, right) = tokio::join!(
        racing.confirm(id.as_str(), "agent-a"),
        racing.confirm(id.as_str(), "agent-b"),
    );

    let (winner, loser) = match (left, right) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert_eq!(winner.version, Version::new(2));
    assert!(matches!(loser, ServiceError::Conflict(_)), "got {loser:?}");
    assert_eq!(inner.load_events(id, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn racing_confirms_with_retry_reject_the_loser() {
    let inner: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let clock = test_clock();
    let id = created(&service_on(inner.clone(), &clock, RetryPolicy::no_retry()))
        .await
        .reservation_id;

    let racing = service_on(
        Arc::new(LockstepEventStore::new(inner.clone(), 2)),
        &clock,
        RetryPolicy::builder()
            .max_retries(3)
            .initial_delay(std::time::Duration::from_millis(1))
            .build(),
    );
    let (left, right) = tokio::join!(
        racing.confirm(id.as_str(), "agent-a"),
        racing.confirm(id.as_str(), "agent-b"),
    );

    let (winner, loser) = match (left, right) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert_eq!(winner.version, Version::new(2));
    assert!(matches!(
        loser,
        ServiceError::InvalidTransition {
            command: "confirm",
            state: "CONFIRMED"
        }
    ));
}

#[tokio::test]
async fn unknown_reservation_is_an_invalid_transition_from_none() {
    let service = service_on(Arc::new(InMemoryEventStore::new()), &test_clock(), RetryPolicy::no_retry());

    let err = service.confirm("no-such-reservation", "agent").await.unwrap_err();

    assert!(matches!(
        err,
        ServiceError::InvalidTransition {
            command: "confirm",
            state: "NONE"
        }
    ));
}

#[tokio::test]
async fn invalid_requests_do_not_consume_numbers() {
    let store = Arc::new(InMemoryEventStore::new());
    let service = service_on(store.clone(), &test_clock(), RetryPolicy::no_retry());

    let past = CreateReservation {
        reservation_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        ..request()
    };
    assert!(matches!(service.create(past).await, Err(ServiceError::Validation(_))));

    let blank = CreateReservation {
        procedure_type: "  ".to_string(),
        ..request()
    };
    assert!(matches!(service.create(blank).await, Err(ServiceError::Validation(_))));
    assert!(store.is_empty());

    let receipt = created(&service).await;
    assert_eq!(
        receipt.reservation_number.unwrap().as_str(),
        "RSV-202501-00001"
    );
}

#[tokio::test]
async fn blank_fields_on_transitions_are_validation_errors() {
    let service = service_on(Arc::new(InMemoryEventStore::new()), &test_clock(), RetryPolicy::no_retry());
    let id = created(&service).await.reservation_id;

    assert!(matches!(
        service.confirm(id.as_str(), " ").await,
        Err(ServiceError::Validation(_))
    ));
    assert!(matches!(
        service.cancel(id.as_str(), &"x".repeat(501)).await,
        Err(ServiceError::Validation(_))
    ));
    assert!(matches!(service.cancel("", "reason").await, Err(ServiceError::Validation(_))));
    assert_eq!(service.load(&id).await.unwrap().1, Version::new(1));
}

#[tokio::test]
async fn storage_failure_commits_nothing() {
    let inner: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let faulty = Arc::new(medtour_testing::FaultyEventStore::new(inner.clone()));
    let service = service_on(faulty.clone(), &test_clock(), RetryPolicy::no_retry());
    let id = created(&service).await.reservation_id;

    faulty.fail_appends(true);
    let err = service.confirm(id.as_str(), "agent").await.unwrap_err();

    assert!(matches!(err, ServiceError::Storage(_)));
    assert_eq!(inner.load_events(AggregateId::new(id.as_str()), None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn number_counter_streams_are_not_reservations() {
    let store = Arc::new(InMemoryEventStore::new());
    let service = service_on(store.clone(), &test_clock(), RetryPolicy::no_retry());
    created(&service).await;
    let counter = "reservation-number-202501";
    assert_eq!(store.load_events(AggregateId::new(counter), None).await.unwrap().len(), 1);

    assert!(matches!(
        service.confirm(counter, "agent").await,
        Err(ServiceError::Validation(_))
    ));
    assert!(matches!(
        service.cancel(counter, "reason").await,
        Err(ServiceError::Validation(_))
    ));
    assert_eq!(store.len(), 2);
}
