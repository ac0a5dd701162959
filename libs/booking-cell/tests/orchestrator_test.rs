mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

use booking_cell::*;
use common::{epoch, range, slot, MockNotifier, MockPayments, MockStore, TestHarness};

#[tokio::test]
async fn test_create_confirm_complete_round_trip() {
    let mut harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();

    assert_eq!(booking.status, BookingStatus::PendingConfirmation);
    assert_eq!(booking.response_deadline, harness.orchestrator.now() + Duration::hours(24));
    assert_eq!(booking.price_cents, 9_500);
    assert!(booking.booking_number.starts_with("FH-0603-"));

    let confirmed = harness.confirm(&booking).await;
    assert_eq!(confirmed.status, BookingStatus::Confirmed);

    harness.payments.mark_settled(booking.id);
    harness.clock.set(booking.requested.end + Duration::minutes(10));
    let completed = harness
        .act(&booking, Actor::system(), BookingAction::MarkCompleted)
        .await
        .unwrap();

    let statuses: Vec<BookingStatus> = completed.status_history.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![BookingStatus::PendingConfirmation, BookingStatus::Confirmed, BookingStatus::Completed]
    );
    assert_eq!(completed.version, 2);

    let events: Vec<BookingEventType> = harness.drain_events().iter().map(|e| e.event_type).collect();
    assert_eq!(events, vec![BookingEventType::Requested, BookingEventType::Confirmed]);
}

#[tokio::test]
async fn test_overlapping_request_is_rejected() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    harness.confirm(&booking).await;

    let overlapping = harness.book(slot(2, 10, 15, 30)).await;
    assert_matches!(overlapping, Err(BookingError::SlotUnavailable));

    // Half-open ranges: starting at the previous end is fine.
    let adjacent = harness.book(slot(2, 10, 30, 30)).await;
    assert!(adjacent.is_ok());
}

#[tokio::test]
async fn test_stranger_cannot_cancel() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 11, 0, 30)).await.unwrap();

    let result = harness
        .act(&booking, Actor::patient(Uuid::new_v4()), BookingAction::Cancel { reason: None })
        .await;
    assert_matches!(result, Err(BookingError::Unauthorized));

    let provider_impostor = harness
        .act(&booking, Actor::provider(Uuid::new_v4()), BookingAction::Cancel { reason: None })
        .await;
    assert_matches!(provider_impostor, Err(BookingError::Unauthorized));

    let stored = harness.orchestrator.get_booking(booking.id).await.unwrap();
    assert_eq!(stored, booking);
}

#[tokio::test]
async fn test_system_actor_must_present_system_identity() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 11, 0, 30)).await.unwrap();
    harness.clock.advance(Duration::hours(25));

    let result = harness
        .orchestrator
        .apply_action(booking.id, Uuid::new_v4(), ActorRole::System, BookingAction::Expire)
        .await;
    assert_matches!(result, Err(BookingError::Unauthorized));
}

#[tokio::test]
async fn test_patient_cannot_perform_provider_action() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 11, 0, 30)).await.unwrap();

    let result = harness
        .act(&booking, Actor::patient(booking.patient_id), BookingAction::Confirm)
        .await;
    assert_matches!(result, Err(BookingError::Unauthorized));
}

#[tokio::test]
async fn test_unknown_booking_is_not_found() {
    let harness = TestHarness::new();
    let missing = Uuid::new_v4();

    let result = harness
        .orchestrator
        .apply_action(missing, Uuid::new_v4(), ActorRole::Provider, BookingAction::Confirm)
        .await;
    assert_matches!(result, Err(BookingError::NotFound { entity: "booking", id }) if id == missing);
}

#[tokio::test]
async fn test_confirm_replay_is_idempotent() {
    let mut harness = TestHarness::new();
    let booking = harness.book(slot(2, 9, 0, 30)).await.unwrap();
    let confirmed = harness.confirm(&booking).await;
    harness.drain_events();

    let replay = harness.confirm(&booking).await;

    assert_eq!(replay, confirmed);
    assert_eq!(replay.status_history.len(), 2);
    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn test_decline_after_confirm_is_invalid_transition() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 9, 0, 30)).await.unwrap();
    harness.confirm(&booking).await;

    let result = harness
        .act(&booking, Actor::provider(booking.provider_id), BookingAction::Decline { reason: None })
        .await;
    assert_matches!(
        result,
        Err(BookingError::InvalidTransition { status: BookingStatus::Confirmed, action: ActionKind::Decline })
    );
}

#[tokio::test]
async fn test_decline_frees_the_slot() {
    let mut harness = TestHarness::new();
    let booking = harness.book(slot(2, 9, 0, 30)).await.unwrap();

    let declined = harness
        .act(
            &booking,
            Actor::provider(booking.provider_id),
            BookingAction::Decline { reason: Some("on leave".into()) },
        )
        .await
        .unwrap();
    assert_eq!(declined.status, BookingStatus::Declined);
    assert_eq!(declined.cancelled_by, Some(ActorRole::Provider));
    assert_eq!(declined.last_change().unwrap().reason.as_deref(), Some("on leave"));

    let events = harness.drain_events();
    let declined_event = events.iter().find(|e| e.event_type == BookingEventType::Declined).unwrap();
    assert_eq!(declined_event.recipient_id, booking.patient_id);

    assert!(harness.book(slot(2, 9, 0, 30)).await.is_ok());
}

#[tokio::test]
async fn test_reschedule_decline_restores_booking() {
    let mut harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    let confirmed = harness.confirm(&booking).await;
    let proposed = range(3, 14, 0, 30);

    let with_proposal = harness
        .act(
            &booking,
            Actor::provider(booking.provider_id),
            BookingAction::ProposeReschedule { slot: proposed, message: Some("running late".into()) },
        )
        .await
        .unwrap();
    let proposal = with_proposal.reschedule_proposal.clone().unwrap();
    assert_eq!(proposal.proposed, proposed);
    assert!(proposal.hold_id.is_some());
    assert_eq!(with_proposal.status, BookingStatus::Confirmed);

    // The proposed slot is held while the patient decides.
    assert_matches!(harness.book(slot(3, 14, 0, 30)).await, Err(BookingError::SlotUnavailable));

    let restored = harness
        .act(&booking, Actor::patient(booking.patient_id), BookingAction::DeclineReschedule)
        .await
        .unwrap();

    assert_eq!(restored.status, confirmed.status);
    assert_eq!(restored.requested, confirmed.requested);
    assert!(restored.reschedule_proposal.is_none());
    assert_eq!(restored.reschedule_history[0].accepted, Some(false));
    assert_eq!(restored.slot_reservation_id, confirmed.slot_reservation_id);

    // Proposal hold is gone, the original slot is still defended.
    assert!(harness.book(slot(3, 14, 0, 30)).await.is_ok());
    assert_matches!(harness.book(slot(2, 10, 0, 30)).await, Err(BookingError::SlotUnavailable));

    let types: Vec<BookingEventType> = harness.drain_events().iter().map(|e| e.event_type).collect();
    assert!(types.contains(&BookingEventType::RescheduleProposed));
    assert!(types.contains(&BookingEventType::RescheduleDeclined));
}

#[tokio::test]
async fn test_reschedule_accept_moves_the_claim() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    let proposed = range(2, 10, 15, 30);

    // Overlapping its own slot is allowed; only other bookings conflict.
    harness
        .act(
            &booking,
            Actor::provider(booking.provider_id),
            BookingAction::ProposeReschedule { slot: proposed, message: None },
        )
        .await
        .unwrap();

    let accepted = harness
        .act(&booking, Actor::patient(booking.patient_id), BookingAction::AcceptReschedule)
        .await
        .unwrap();

    assert_eq!(accepted.status, BookingStatus::Confirmed);
    assert_eq!(accepted.requested, proposed);
    assert_ne!(accepted.slot_reservation_id, booking.slot_reservation_id);
    assert_eq!(accepted.reschedule_history[0].accepted, Some(true));

    let claims = harness.ledger.entries(booking.provider_id).await;
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].slot, proposed);
    assert_eq!(claims[0].state, ReservationState::Converted);

    assert!(harness.book(slot(2, 9, 30, 30)).await.is_ok());
    assert_matches!(harness.book(slot(2, 10, 30, 30)).await, Err(BookingError::SlotUnavailable));
}

#[tokio::test]
async fn test_accept_after_hold_lapsed_reacquires_slot() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(5, 10, 0, 30)).await.unwrap();
    harness.confirm(&booking).await;
    let proposed = range(5, 15, 0, 30);

    harness
        .act(
            &booking,
            Actor::provider(booking.provider_id),
            BookingAction::ProposeReschedule { slot: proposed, message: None },
        )
        .await
        .unwrap();

    harness.clock.advance(Duration::hours(30));
    harness.orchestrator.release_expired_reservations(harness.orchestrator.now()).await.unwrap();

    let accepted = harness
        .act(&booking, Actor::patient(booking.patient_id), BookingAction::AcceptReschedule)
        .await
        .unwrap();
    assert_eq!(accepted.requested, proposed);
    assert_matches!(harness.book(slot(5, 15, 0, 30)).await, Err(BookingError::SlotUnavailable));
}

#[tokio::test]
async fn test_proposal_into_taken_slot_is_rejected() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    harness.book(slot(2, 12, 0, 30)).await.unwrap();

    let result = harness
        .act(
            &booking,
            Actor::provider(booking.provider_id),
            BookingAction::ProposeReschedule { slot: range(2, 12, 0, 30), message: None },
        )
        .await;
    assert_matches!(result, Err(BookingError::SlotUnavailable));

    let stored = harness.orchestrator.get_booking(booking.id).await.unwrap();
    assert_eq!(stored, booking);
}

#[tokio::test]
async fn test_reschedule_limit_is_enforced() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    let provider = Actor::provider(booking.provider_id);
    let patient = Actor::patient(booking.patient_id);

    for hour in [13, 14] {
        harness
            .act(&booking, provider, BookingAction::ProposeReschedule { slot: range(2, hour, 0, 30), message: None })
            .await
            .unwrap();
        harness.act(&booking, patient, BookingAction::DeclineReschedule).await.unwrap();
    }

    let result = harness
        .act(&booking, provider, BookingAction::ProposeReschedule { slot: range(2, 15, 0, 30), message: None })
        .await;
    assert_matches!(result, Err(BookingError::RescheduleLimitReached { max: 2 }));
}

#[tokio::test]
async fn test_cancel_notifies_other_party_and_releases_slot() {
    let mut harness = TestHarness::new();
    let booking = harness.book(slot(2, 16, 0, 30)).await.unwrap();
    harness.confirm(&booking).await;
    harness.drain_events();

    let cancelled = harness
        .act(
            &booking,
            Actor::patient(booking.patient_id),
            BookingAction::Cancel { reason: Some("feeling better".into()) },
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(ActorRole::Patient));

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BookingEventType::Cancelled);
    assert_eq!(events[0].recipient_id, booking.provider_id);

    assert!(harness.ledger.entries(booking.provider_id).await.is_empty());
    assert!(harness.book(slot(2, 16, 0, 30)).await.is_ok());

    let again = harness
        .act(&booking, Actor::provider(booking.provider_id), BookingAction::Cancel { reason: None })
        .await;
    assert_matches!(again, Err(BookingError::InvalidTransition { status: BookingStatus::Cancelled, .. }));
}

#[tokio::test]
async fn test_instant_booking_auto_confirms() {
    let mut harness = TestHarness::new();
    let patient_id = Uuid::new_v4();
    let (start, end) = slot(2, 8, 0, 45);

    let booking = harness
        .orchestrator
        .create_booking(patient_id, harness.instant_provider_id, harness.instant_service_id, start, end)
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.status_history.len(), 2);
    assert_eq!(booking.status_history[1].actor, Actor::system());

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BookingEventType::Confirmed);
    assert_eq!(events[0].recipient_id, patient_id);
}

#[tokio::test]
async fn test_invalid_service_releases_the_hold() {
    let harness = TestHarness::new();
    let (start, end) = slot(2, 10, 0, 30);

    let unknown = harness
        .orchestrator
        .create_booking(Uuid::new_v4(), harness.provider_id, Uuid::new_v4(), start, end)
        .await;
    assert_matches!(unknown, Err(BookingError::InvalidService(_)));

    let foreign = harness
        .orchestrator
        .create_booking(Uuid::new_v4(), harness.provider_id, harness.instant_service_id, start, end)
        .await;
    assert_matches!(foreign, Err(BookingError::InvalidService(_)));

    assert!(harness.book((start, end)).await.is_ok());
}

#[tokio::test]
async fn test_unknown_provider_and_bad_ranges() {
    let harness = TestHarness::new();
    let (start, end) = slot(2, 10, 0, 30);

    let unknown = harness
        .orchestrator
        .create_booking(Uuid::new_v4(), Uuid::new_v4(), harness.service_id, start, end)
        .await;
    assert_matches!(unknown, Err(BookingError::NotFound { entity: "provider", .. }));

    assert_matches!(harness.book((end, start)).await, Err(BookingError::InvalidTimeRange(_)));
    assert_matches!(harness.book(slot(-1, 10, 0, 30)).await, Err(BookingError::InvalidTimeRange(_)));
}

#[tokio::test]
async fn test_reservation_flow_and_abandon() {
    let harness = TestHarness::new();
    let (start, end) = slot(2, 10, 0, 30);

    let handle = harness.orchestrator.reserve_slot(harness.provider_id, start, end).await.unwrap();
    assert_matches!(harness.book((start, end)).await, Err(BookingError::SlotUnavailable));

    assert!(harness.orchestrator.abandon_reservation(&handle).await.unwrap());
    assert!(!harness.orchestrator.abandon_reservation(&handle).await.unwrap());

    let second = harness.orchestrator.reserve_slot(harness.provider_id, start, end).await.unwrap();
    harness.clock.advance(Duration::minutes(6));

    let late = harness
        .orchestrator
        .submit_reservation(second, Uuid::new_v4(), harness.service_id)
        .await;
    assert_matches!(late, Err(BookingError::SlotUnavailable));
    assert!(harness.store.is_empty().await);

    let third = harness.orchestrator.reserve_slot(harness.provider_id, start, end).await.unwrap();
    let booking = harness
        .orchestrator
        .submit_reservation(third, Uuid::new_v4(), harness.service_id)
        .await
        .unwrap();
    assert_eq!(booking.slot_reservation_id, third.id);
}

#[tokio::test]
async fn test_resubmitting_a_handle_keeps_the_first_claim() {
    let harness = TestHarness::new();
    let (start, end) = slot(2, 10, 0, 30);

    let handle = harness.orchestrator.reserve_slot(harness.provider_id, start, end).await.unwrap();
    let first = harness
        .orchestrator
        .submit_reservation(handle, Uuid::new_v4(), harness.service_id)
        .await
        .unwrap();

    let retry = harness
        .orchestrator
        .submit_reservation(handle, Uuid::new_v4(), harness.service_id)
        .await;
    assert_matches!(retry, Err(BookingError::SlotUnavailable));

    assert_eq!(harness.ledger.entries(harness.provider_id).await.len(), 1);
    assert_matches!(harness.book((start, end)).await, Err(BookingError::SlotUnavailable));
    assert_eq!(
        harness.orchestrator.get_booking(first.id).await.unwrap().status,
        BookingStatus::PendingConfirmation
    );
    assert_eq!(harness.store.len().await, 1);
}

#[tokio::test]
async fn test_abandon_after_submit_leaves_the_claim() {
    let harness = TestHarness::new();
    let (start, end) = slot(2, 11, 0, 30);

    let handle = harness.orchestrator.reserve_slot(harness.provider_id, start, end).await.unwrap();
    let booking = harness
        .orchestrator
        .submit_reservation(handle, Uuid::new_v4(), harness.service_id)
        .await
        .unwrap();

    assert!(!harness.orchestrator.abandon_reservation(&handle).await.unwrap());

    let entries = harness.ledger.entries(harness.provider_id).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].held_by, SlotHolder::Booking(booking.id));
    assert_matches!(harness.book((start, end)).await, Err(BookingError::SlotUnavailable));
}

#[tokio::test]
async fn test_mark_completed_waits_for_settlement() {
    let mut payments = MockPayments::new();
    let mut sequence = mockall::Sequence::new();
    // Settlement is checked on every attempt, including the premature one.
    payments.expect_is_settled().times(2).in_sequence(&mut sequence).returning(|_| Ok(false));
    payments.expect_is_settled().times(1).in_sequence(&mut sequence).returning(|_| Ok(true));

    let harness = TestHarness::with_payments(Arc::new(payments));
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    harness.confirm(&booking).await;

    let early = harness.act(&booking, Actor::system(), BookingAction::MarkCompleted).await;
    assert_matches!(early, Err(BookingError::InvalidTransition { .. }));

    harness.clock.set(booking.requested.end + Duration::hours(1));
    let unpaid = harness.act(&booking, Actor::system(), BookingAction::MarkCompleted).await.unwrap();
    assert_eq!(unpaid.status, BookingStatus::PendingPayment);

    let paid = harness.act(&booking, Actor::system(), BookingAction::MarkCompleted).await.unwrap();
    assert_eq!(paid.status, BookingStatus::Completed);
    assert_eq!(paid.status_history.len(), 4);
}

#[tokio::test]
async fn test_mark_no_show_after_visit() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    harness.confirm(&booking).await;
    harness.clock.set(booking.requested.end);

    let no_show = harness.act(&booking, Actor::system(), BookingAction::MarkNoShow).await.unwrap();
    assert_eq!(no_show.status, BookingStatus::NoShow);
    assert!(harness.ledger.entries(booking.provider_id).await.is_empty());
}

#[tokio::test]
async fn test_notification_failure_does_not_roll_back() {
    let mut notifier = MockNotifier::new();
    notifier
        .expect_dispatch()
        .returning(|_| Err(anyhow::anyhow!("queue unavailable")));

    let harness = TestHarness::with_notifier(Arc::new(notifier));
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    let confirmed = harness.confirm(&booking).await;

    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    let stored = harness.orchestrator.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_bookings_for_user_filters_and_sorts() {
    let harness = TestHarness::new();
    let patient_id = Uuid::new_v4();
    let mut created = Vec::new();
    for (start, end) in [slot(4, 9, 0, 30), slot(2, 9, 0, 30), slot(3, 9, 0, 30)] {
        let booking = harness
            .orchestrator
            .create_booking(patient_id, harness.provider_id, harness.service_id, start, end)
            .await
            .unwrap();
        created.push(booking);
    }
    let (later, sooner, dropped) = (created[0].clone(), created[1].clone(), created[2].clone());
    harness
        .act(&dropped, Actor::patient(patient_id), BookingAction::Cancel { reason: None })
        .await
        .unwrap();

    let upcoming = harness
        .orchestrator
        .get_bookings_for_user(patient_id, ActorRole::Patient, Some(StatusFilter::Upcoming))
        .await
        .unwrap();
    let ids: Vec<Uuid> = upcoming.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![sooner.id, later.id]);

    let cancelled = harness
        .orchestrator
        .get_bookings_for_user(patient_id, ActorRole::Patient, Some("cancelled".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, dropped.id);

    let for_provider = harness
        .orchestrator
        .get_bookings_for_user(harness.provider_id, ActorRole::Provider, None)
        .await
        .unwrap();
    assert_eq!(for_provider.len(), 3);

    let system = harness
        .orchestrator
        .get_bookings_for_user(SYSTEM_ACTOR_ID, ActorRole::System, None)
        .await;
    assert_matches!(system, Err(BookingError::Unauthorized));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_never_double_book() {
    let harness = TestHarness::new();
    let orchestrator = harness.orchestrator.clone();
    let provider_id = harness.provider_id;
    let service_id = harness.service_id;

    // Staggered 30-minute requests every 10 minutes between 09:00 and 11:00.
    let tasks = (0..36i64).map(|i| {
        let orchestrator = orchestrator.clone();
        let offset = Duration::minutes((i % 12) * 10);
        let (start, end) = slot(2, 9, 0, 30);
        let (start, end) = (start + offset, end + offset);
        tokio::spawn(async move {
            orchestrator
                .create_booking(Uuid::new_v4(), provider_id, service_id, start, end)
                .await
        })
    });

    let results: Vec<Result<Booking, BookingError>> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert!(results.iter().all(|r| matches!(r, Ok(_) | Err(BookingError::SlotUnavailable))));

    let active: Vec<Booking> = harness
        .store
        .all()
        .await
        .into_iter()
        .filter(|b| b.status.is_active())
        .collect();
    assert!(!active.is_empty());
    for (i, a) in active.iter().enumerate() {
        for b in active.iter().skip(i + 1) {
            assert!(!a.requested.overlaps(&b.requested), "{} overlaps {}", a.requested, b.requested);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_actions_on_one_booking_are_serialized() {
    let harness = TestHarness::new();
    let booking = harness.book(slot(2, 10, 0, 30)).await.unwrap();
    let orchestrator = harness.orchestrator.clone();

    let confirm = {
        let orchestrator = orchestrator.clone();
        let booking = booking.clone();
        tokio::spawn(async move {
            orchestrator
                .apply_action(booking.id, booking.provider_id, ActorRole::Provider, BookingAction::Confirm)
                .await
        })
    };
    let cancel = {
        let orchestrator = orchestrator.clone();
        let booking = booking.clone();
        tokio::spawn(async move {
            orchestrator
                .apply_action(booking.id, booking.patient_id, ActorRole::Patient, BookingAction::Cancel { reason: None })
                .await
        })
    };

    let cancel_result = cancel.await.unwrap();
    let confirm_result = confirm.await.unwrap();
    assert!(cancel_result.is_ok());

    let stored = harness.orchestrator.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    // Either confirm ran first (3 entries) or it hit a cancelled booking.
    match confirm_result {
        Ok(_) => assert_eq!(stored.status_history.len(), 3),
        Err(e) => {
            assert_matches!(e, BookingError::InvalidTransition { status: BookingStatus::Cancelled, .. });
            assert_eq!(stored.status_history.len(), 2);
        }
    }
}

fn orchestrator_over(store: MockStore, clock: Arc<ManualClock>) -> BookingOrchestrator {
    let (notifier, _events) = ChannelNotifier::new();
    BookingOrchestrator::new(
        Arc::new(InMemoryReservationLedger::new(clock.clone())),
        Arc::new(store),
        Collaborators {
            directory: Arc::new(StaticProviderDirectory::new()),
            payments: Arc::new(StaticPaymentGateway::new()),
            notifier: Arc::new(notifier),
        },
        clock,
        BookingConfig::default(),
    )
}

fn stored_booking() -> Booking {
    let service = ServiceInfo {
        id: Uuid::new_v4(),
        provider_id: None,
        duration_minutes: 30,
        price_cents: 9_500,
    };
    Booking::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        &service,
        range(2, 10, 0, 30),
        Uuid::new_v4(),
        epoch() + Duration::hours(24),
        epoch(),
    )
}

#[tokio::test]
async fn test_concurrent_modification_is_retried_until_it_commits() {
    let booking = stored_booking();
    let mut store = MockStore::new();
    let mut sequence = mockall::Sequence::new();

    let stored = booking.clone();
    store.expect_get().times(3).returning(move |_| Ok(stored.clone()));
    store
        .expect_update()
        .times(2)
        .in_sequence(&mut sequence)
        .returning(|b, _| Err(BookingError::ConcurrentModification(b.id)));
    store
        .expect_update()
        .times(1)
        .in_sequence(&mut sequence)
        .returning(|b, version| {
            let mut committed = b.clone();
            committed.version = version + 1;
            Ok(committed)
        });

    let orchestrator = orchestrator_over(store, Arc::new(ManualClock::new(epoch())));
    let confirmed = orchestrator
        .apply_action(booking.id, booking.provider_id, ActorRole::Provider, BookingAction::Confirm)
        .await
        .unwrap();

    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.version, 1);
}

#[tokio::test]
async fn test_concurrent_modification_surfaces_after_max_attempts() {
    let booking = stored_booking();
    let mut store = MockStore::new();

    let stored = booking.clone();
    store.expect_get().times(3).returning(move |_| Ok(stored.clone()));
    store
        .expect_update()
        .times(3)
        .returning(|b, _| Err(BookingError::ConcurrentModification(b.id)));

    let orchestrator = orchestrator_over(store, Arc::new(ManualClock::new(epoch())));
    let result = orchestrator
        .apply_action(booking.id, booking.provider_id, ActorRole::Provider, BookingAction::Confirm)
        .await;

    assert_matches!(result, Err(BookingError::ConcurrentModification(id)) if id == booking.id);
}
