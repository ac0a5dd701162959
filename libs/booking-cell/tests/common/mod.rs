#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mockall::mock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use booking_cell::*;

mock! {
    pub Payments {}

    #[async_trait]
    impl PaymentGateway for Payments {
        async fn is_settled(&self, booking_id: Uuid) -> anyhow::Result<bool>;
    }
}

mock! {
    pub Notifier {}

    #[async_trait]
    impl NotificationDispatcher for Notifier {
        async fn dispatch(&self, event: BookingEvent) -> anyhow::Result<()>;
    }
}

mock! {
    pub Store {}

    #[async_trait]
    impl BookingStore for Store {
        async fn insert(&self, booking: &Booking) -> Result<(), BookingError>;
        async fn get(&self, booking_id: Uuid) -> Result<Booking, BookingError>;
        async fn update(&self, booking: &Booking, expected_version: u64) -> Result<Booking, BookingError>;
        async fn list_for_user(&self, user_id: Uuid, role: ActorRole) -> Result<Vec<Booking>, BookingError>;
        async fn pending_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, BookingError>;
    }
}

/// In-memory ledger whose releases can be switched to fail, as a Redis
/// outage would.
pub struct FlakyLedger {
    inner: Arc<InMemoryReservationLedger>,
    failing: AtomicBool,
}

impl FlakyLedger {
    pub fn new(inner: Arc<InMemoryReservationLedger>) -> Self {
        Self { inner, failing: AtomicBool::new(false) }
    }

    pub fn fail_releases(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReservationLedger for FlakyLedger {
    async fn acquire(
        &self,
        provider_id: Uuid,
        slot: TimeRange,
        ttl: Duration,
        holder: SlotHolder,
    ) -> Result<ReservationHandle, LedgerError> {
        self.inner.acquire(provider_id, slot, ttl, holder).await
    }

    async fn release(&self, handle: &ReservationHandle, reason: ReleaseReason) -> Result<bool, LedgerError> {
        self.check()?;
        self.inner.release(handle, reason).await
    }

    async fn promote(&self, handle: &ReservationHandle, booking_id: Uuid) -> Result<ReservationHandle, LedgerError> {
        self.inner.promote(handle, booking_id).await
    }

    async fn release_holder(
        &self,
        provider_id: Uuid,
        booking_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<u64, LedgerError> {
        self.check()?;
        self.inner.release_holder(provider_id, booking_id, reason).await
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<ReservationHandle>, LedgerError> {
        self.inner.release_expired(now).await
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        self.inner.stats().await
    }
}

/// Monday 2030-06-03 08:00 UTC. Every test timeline starts here.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 6, 3, 8, 0, 0).unwrap()
}

/// `(start, end)` on the day `days` after the epoch.
pub fn slot(days: i64, hour: u32, minute: u32, minutes: i64) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = Utc.with_ymd_and_hms(2030, 6, 3, hour, minute, 0).unwrap() + Duration::days(days);
    (day, day + Duration::minutes(minutes))
}

pub fn range(days: i64, hour: u32, minute: u32, minutes: i64) -> TimeRange {
    let (start, end) = slot(days, hour, minute, minutes);
    TimeRange::new(start, end).unwrap()
}

pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<InMemoryReservationLedger>,
    pub store: Arc<InMemoryBookingStore>,
    pub directory: Arc<StaticProviderDirectory>,
    pub payments: Arc<StaticPaymentGateway>,
    pub events: UnboundedReceiver<BookingEvent>,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub flaky_ledger: Option<Arc<FlakyLedger>>,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub instant_provider_id: Uuid,
    pub instant_service_id: Uuid,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(None, None, false)
    }

    pub fn with_payments(payments: Arc<dyn PaymentGateway>) -> Self {
        Self::build(Some(payments), None, false)
    }

    pub fn with_notifier(notifier: Arc<dyn NotificationDispatcher>) -> Self {
        Self::build(None, Some(notifier), false)
    }

    /// Orchestrator behind a `FlakyLedger`; `ledger` still shows the entries.
    pub fn with_flaky_ledger() -> Self {
        Self::build(None, None, true)
    }

    fn build(
        payments: Option<Arc<dyn PaymentGateway>>,
        notifier: Option<Arc<dyn NotificationDispatcher>>,
        flaky: bool,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(epoch()));
        let ledger = Arc::new(InMemoryReservationLedger::new(clock.clone()));
        let flaky_ledger = flaky.then(|| Arc::new(FlakyLedger::new(ledger.clone())));
        let orchestrator_ledger: Arc<dyn ReservationLedger> = match &flaky_ledger {
            Some(flaky) => flaky.clone(),
            None => ledger.clone(),
        };
        let store = Arc::new(InMemoryBookingStore::new());
        let directory = Arc::new(StaticProviderDirectory::new());
        let static_payments = Arc::new(StaticPaymentGateway::new());
        let (channel, events) = ChannelNotifier::new();

        let provider_id = Uuid::new_v4();
        let service_id = Uuid::new_v4();
        let instant_provider_id = Uuid::new_v4();
        let instant_service_id = Uuid::new_v4();

        directory.add_provider(ProviderInfo { id: provider_id, booking_policy: BookingPolicy::Request });
        directory.add_service(ServiceInfo {
            id: service_id,
            provider_id: Some(provider_id),
            duration_minutes: 30,
            price_cents: 9_500,
        });
        directory.add_provider(ProviderInfo { id: instant_provider_id, booking_policy: BookingPolicy::Instant });
        directory.add_service(ServiceInfo {
            id: instant_service_id,
            provider_id: Some(instant_provider_id),
            duration_minutes: 45,
            price_cents: 15_000,
        });

        let collaborators = Collaborators {
            directory: directory.clone(),
            payments: payments.unwrap_or_else(|| static_payments.clone() as Arc<dyn PaymentGateway>),
            notifier: notifier.unwrap_or_else(|| Arc::new(channel) as Arc<dyn NotificationDispatcher>),
        };

        let orchestrator = Arc::new(BookingOrchestrator::new(
            orchestrator_ledger,
            store.clone(),
            collaborators,
            clock.clone(),
            BookingConfig::default(),
        ));

        Self {
            clock,
            ledger,
            store,
            directory,
            payments: static_payments,
            events,
            orchestrator,
            flaky_ledger,
            provider_id,
            service_id,
            instant_provider_id,
            instant_service_id,
        }
    }

    /// Request-policy booking for a fresh patient.
    pub async fn book(&self, (start, end): (DateTime<Utc>, DateTime<Utc>)) -> Result<Booking, BookingError> {
        self.orchestrator
            .create_booking(Uuid::new_v4(), self.provider_id, self.service_id, start, end)
            .await
    }

    pub async fn act(&self, booking: &Booking, actor: Actor, action: BookingAction) -> Result<Booking, BookingError> {
        self.orchestrator
            .apply_action(booking.id, actor.user_id, actor.role, action)
            .await
    }

    pub async fn confirm(&self, booking: &Booking) -> Booking {
        self.act(booking, Actor::provider(booking.provider_id), BookingAction::Confirm)
            .await
            .unwrap()
    }

    pub fn drain_events(&mut self) -> Vec<BookingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
