// libs/booking-cell/src/services/orchestrator.rs
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shared_models::{Actor, ActorRole};

use crate::clock::Clock;
use crate::error::{BookingError, LedgerError};
use crate::models::{
    Booking, BookingAction, BookingConfig, BookingEvent, BookingEventType, BookingPolicy,
    LedgerStats, ReleaseReason, ReservationHandle, SlotHolder, StatusFilter, TimeRange,
};
use crate::services::directory::{PaymentGateway, ProviderDirectory};
use crate::services::ledger::ReservationLedger;
use crate::services::notifier::NotificationDispatcher;
use crate::services::state_machine::{
    AppliedTransition, BookingStateMachine, SlotEffect, Transition, TransitionContext,
};
use crate::services::store::BookingStore;

/// External systems the orchestrator consults but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn ProviderDirectory>,
    pub payments: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

/// Ledger release owed by a committed transition.
#[derive(Debug, Clone)]
enum SlotCleanup {
    Holder { provider_id: Uuid, booking_id: Uuid, reason: ReleaseReason },
    Entry { handle: ReservationHandle, reason: ReleaseReason },
}

/// Sole owner of the reservation ledger and the only writer of bookings.
pub struct BookingOrchestrator {
    ledger: Arc<dyn ReservationLedger>,
    store: Arc<dyn BookingStore>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    state_machine: BookingStateMachine,
    config: BookingConfig,
    booking_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    pending_cleanups: Mutex<Vec<SlotCleanup>>,
}

impl BookingOrchestrator {
    pub fn new(
        ledger: Arc<dyn ReservationLedger>,
        store: Arc<dyn BookingStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        config: BookingConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            collaborators,
            clock,
            state_machine: BookingStateMachine::new(),
            config,
            booking_locks: Mutex::new(HashMap::new()),
            pending_cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &BookingConfig {
        &self.config
    }

    // ==========================================================================
    // CREATION
    // ==========================================================================

    /// Reserve, build and persist a new booking in one call.
    #[instrument(skip(self))]
    pub async fn create_booking(
        &self,
        patient_id: Uuid,
        provider_id: Uuid,
        service_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Booking, BookingError> {
        let handle = self.reserve_slot(provider_id, start, end).await?;
        self.submit_reservation(handle, patient_id, service_id).await
    }

    /// First half of a booking flow: hold the slot for the reservation TTL
    /// while the patient fills in the rest.
    pub async fn reserve_slot(
        &self,
        provider_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReservationHandle, BookingError> {
        let slot = TimeRange::new(start, end)?;
        if slot.start <= self.now() {
            return Err(BookingError::InvalidTimeRange(format!("slot {} starts in the past", slot)));
        }

        let provider = self
            .collaborators
            .directory
            .get_provider(provider_id)
            .await
            .map_err(|e| BookingError::Collaborator(e.to_string()))?;
        if provider.is_none() {
            return Err(BookingError::NotFound { entity: "provider", id: provider_id });
        }

        let token = Uuid::new_v4();
        let handle = self
            .ledger
            .acquire(provider_id, slot, self.config.reservation_ttl, SlotHolder::Request(token))
            .await
            .map_err(|e| {
                debug!("Slot {} unavailable for provider {}: {}", slot, provider_id, e);
                BookingError::from(e)
            })?;

        debug!("Reservation {} held until {}", handle.id, handle.expires_at);
        Ok(handle)
    }

    /// Second half of a booking flow: turn a live hold into a booking.
    #[instrument(skip(self, handle), fields(reservation_id = %handle.id))]
    pub async fn submit_reservation(
        &self,
        handle: ReservationHandle,
        patient_id: Uuid,
        service_id: Uuid,
    ) -> Result<Booking, BookingError> {
        match self.build_booking(&handle, patient_id, service_id).await {
            Ok(booking) => Ok(booking),
            // The hold lapsed or already became a booking; nothing left to give back.
            Err(BookingError::SlotUnavailable) => Err(BookingError::SlotUnavailable),
            Err(e) => {
                self.release_quietly(&handle, ReleaseReason::RequestAbandoned).await;
                Err(e)
            }
        }
    }

    /// Give a hold back before it would expire on its own. Returns whether a
    /// hold was released; a hold already submitted as a booking stays put.
    pub async fn abandon_reservation(&self, handle: &ReservationHandle) -> Result<bool, BookingError> {
        if let SlotHolder::Booking(_) = handle.holder {
            // Claims owned by a booking only go away through its lifecycle.
            return Err(BookingError::Unauthorized);
        }
        Ok(self.ledger.release(handle, ReleaseReason::RequestAbandoned).await?)
    }

    async fn build_booking(
        &self,
        handle: &ReservationHandle,
        patient_id: Uuid,
        service_id: Uuid,
    ) -> Result<Booking, BookingError> {
        let directory = &self.collaborators.directory;
        let provider = directory
            .get_provider(handle.provider_id)
            .await
            .map_err(|e| BookingError::Collaborator(e.to_string()))?
            .ok_or(BookingError::NotFound { entity: "provider", id: handle.provider_id })?;

        let service = match directory.get_service(service_id).await {
            Ok(Some(service)) => service,
            Ok(None) => return Err(BookingError::InvalidService(format!("service {} not found", service_id))),
            Err(e) => return Err(BookingError::InvalidService(format!("service lookup failed: {}", e))),
        };
        if matches!(service.provider_id, Some(owner) if owner != provider.id) {
            return Err(BookingError::InvalidService(format!(
                "service {} is not offered by provider {}",
                service_id, provider.id
            )));
        }

        let booking_id = Uuid::new_v4();
        let claim = self.ledger.promote(handle, booking_id).await?;

        let now = self.now();
        let mut booking = Booking::new(
            booking_id,
            patient_id,
            provider.id,
            &service,
            handle.slot,
            claim.id,
            now + self.config.response_deadline,
            now,
        );
        if provider.booking_policy == BookingPolicy::Instant {
            self.state_machine.auto_confirm(&mut booking, now);
        }

        self.store.insert(&booking).await?;

        info!(
            "Booking {} ({}) created for provider {} at {}",
            booking.booking_number, booking.id, booking.provider_id, booking.requested
        );

        let (event_type, recipient) = match provider.booking_policy {
            BookingPolicy::Instant => (BookingEventType::Confirmed, booking.patient_id),
            BookingPolicy::Request => (BookingEventType::Requested, booking.provider_id),
        };
        self.notify(&booking, event_type, &[recipient]).await;

        Ok(booking)
    }

    // ==========================================================================
    // ACTIONS
    // ==========================================================================

    /// Apply one lifecycle action on behalf of an authenticated actor.
    #[instrument(skip(self, action), fields(action = %action.kind()))]
    pub async fn apply_action(
        &self,
        booking_id: Uuid,
        actor_id: Uuid,
        actor_role: ActorRole,
        action: BookingAction,
    ) -> Result<Booking, BookingError> {
        let actor = Actor::new(actor_id, actor_role);
        let lock = self.booking_lock(booking_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_with_retry(booking_id, &actor, &action).await
        };
        self.forget_lock(booking_id, lock).await;
        result
    }

    async fn apply_with_retry(
        &self,
        booking_id: Uuid,
        actor: &Actor,
        action: &BookingAction,
    ) -> Result<Booking, BookingError> {
        let max_attempts = self.config.max_retry_attempts;

        for attempt in 1..=max_attempts {
            match self.try_apply(booking_id, actor, action).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "Concurrent modification of booking {}, retrying attempt {}/{}",
                        booking_id, attempt, max_attempts
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(100 * attempt as u64)).await;
                }
                other => return other,
            }
        }

        Err(BookingError::ConcurrentModification(booking_id))
    }

    async fn try_apply(
        &self,
        booking_id: Uuid,
        actor: &Actor,
        action: &BookingAction,
    ) -> Result<Booking, BookingError> {
        let current = self.store.get(booking_id).await?;
        Self::authorize(&current, actor)?;

        let payment_settled = match action {
            BookingAction::MarkCompleted => self
                .collaborators
                .payments
                .is_settled(booking_id)
                .await
                .map_err(|e| BookingError::Collaborator(e.to_string()))?,
            _ => false,
        };
        let ctx = TransitionContext {
            now: self.now(),
            payment_settled,
            max_reschedules: self.config.max_reschedules,
        };

        let mut transition = match self.state_machine.apply(&current, actor, action, &ctx)? {
            Transition::AlreadyApplied => {
                debug!("Booking {} already reflects {}", booking_id, action.kind());
                return Ok(current);
            }
            Transition::Applied(transition) => transition,
        };

        let acquired = self.prepare_slot(&current, &mut transition).await?;

        let committed = match self.store.update(&transition.booking, current.version).await {
            Ok(committed) => committed,
            Err(e) => {
                if let Some(handle) = acquired {
                    self.release_quietly(&handle, ReleaseReason::ProposalWithdrawn).await;
                }
                return Err(e);
            }
        };

        info!(
            "Booking {} moved {} -> {} by {}",
            committed.id, current.status, committed.status, actor
        );

        self.finish_slot(&committed, &transition.slot_effect).await;
        if let Some(event_type) = transition.notification {
            let recipients = Self::recipients(&committed, event_type, actor.role);
            self.notify(&committed, event_type, &recipients).await;
        }

        Ok(committed)
    }

    fn authorize(booking: &Booking, actor: &Actor) -> Result<(), BookingError> {
        let allowed = match actor.role {
            ActorRole::Patient => booking.patient_id == actor.user_id,
            ActorRole::Provider => booking.provider_id == actor.user_id,
            ActorRole::System => actor.is_system(),
        };
        if !allowed {
            warn!("Actor {} is not a party to booking {}", actor, booking.id);
            return Err(BookingError::Unauthorized);
        }
        Ok(())
    }

    /// Ledger work that must succeed before the transition is committed.
    /// Returns the handle to give back if the commit fails.
    async fn prepare_slot(
        &self,
        current: &Booking,
        transition: &mut AppliedTransition,
    ) -> Result<Option<ReservationHandle>, BookingError> {
        let booking = &mut transition.booking;

        match transition.slot_effect {
            SlotEffect::HoldProposal(slot) => {
                let hold = self
                    .ledger
                    .acquire(booking.provider_id, slot, self.config.reschedule_hold, SlotHolder::Booking(booking.id))
                    .await?;
                if let Some(proposal) = booking.reschedule_proposal.as_mut() {
                    proposal.hold_id = Some(hold.id);
                }
                Ok(Some(hold))
            }
            SlotEffect::SwapToProposal { slot, hold_id, .. } => {
                let claim = self.claim_proposed_slot(current, slot, hold_id).await?;
                booking.slot_reservation_id = claim.id;
                Ok(Some(claim))
            }
            SlotEffect::None | SlotEffect::ReleaseProposal(_) | SlotEffect::ReleaseAll => Ok(None),
        }
    }

    /// Promote the proposal hold, or take the slot again if the hold lapsed.
    async fn claim_proposed_slot(
        &self,
        booking: &Booking,
        slot: TimeRange,
        hold_id: Option<Uuid>,
    ) -> Result<ReservationHandle, BookingError> {
        if let Some(id) = hold_id {
            let hold = self.booking_handle(booking, id, slot);
            match self.ledger.promote(&hold, booking.id).await {
                Ok(claim) => return Ok(claim),
                Err(LedgerError::ReservationLost(_)) => {
                    debug!("Proposal hold {} lapsed, re-acquiring slot {}", id, slot);
                    self.ledger.release(&hold, ReleaseReason::Expired).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let hold = self
            .ledger
            .acquire(booking.provider_id, slot, self.config.reservation_ttl, SlotHolder::Booking(booking.id))
            .await?;
        Ok(self.ledger.promote(&hold, booking.id).await?)
    }

    /// Ledger cleanup after commit. The committed booking is never rolled
    /// back; a failed release is queued for the next sweep.
    async fn finish_slot(&self, booking: &Booking, effect: &SlotEffect) {
        let cleanup = match effect {
            SlotEffect::ReleaseAll => SlotCleanup::Holder {
                provider_id: booking.provider_id,
                booking_id: booking.id,
                reason: ReleaseReason::BookingClosed,
            },
            SlotEffect::SwapToProposal { previous_claim, slot, .. } => SlotCleanup::Entry {
                handle: self.booking_handle(booking, *previous_claim, *slot),
                reason: ReleaseReason::Rescheduled,
            },
            SlotEffect::ReleaseProposal(Some(hold_id)) => SlotCleanup::Entry {
                handle: self.booking_handle(booking, *hold_id, booking.requested),
                reason: ReleaseReason::ProposalWithdrawn,
            },
            SlotEffect::None | SlotEffect::HoldProposal(_) | SlotEffect::ReleaseProposal(None) => return,
        };

        if let Err(e) = self.run_cleanup(&cleanup).await {
            warn!("Slot cleanup for booking {} failed, deferring to next sweep: {}", booking.id, e);
            self.pending_cleanups.lock().await.push(cleanup);
        }
    }

    async fn run_cleanup(&self, cleanup: &SlotCleanup) -> Result<u64, LedgerError> {
        match cleanup {
            SlotCleanup::Holder { provider_id, booking_id, reason } => {
                self.ledger.release_holder(*provider_id, *booking_id, *reason).await
            }
            SlotCleanup::Entry { handle, reason } => {
                Ok(self.ledger.release(handle, *reason).await? as u64)
            }
        }
    }

    /// Handle for an entry owned by `booking`. Release and promote only look
    /// at the id and provider, so the slot is informational.
    fn booking_handle(&self, booking: &Booking, id: Uuid, slot: TimeRange) -> ReservationHandle {
        ReservationHandle {
            id,
            provider_id: booking.provider_id,
            slot,
            holder: SlotHolder::Booking(booking.id),
            expires_at: booking.updated_at,
        }
    }

    async fn release_quietly(&self, handle: &ReservationHandle, reason: ReleaseReason) {
        if let Err(e) = self.ledger.release(handle, reason).await {
            warn!("Failed to release reservation {}: {}", handle.id, e);
        }
    }

    // ==========================================================================
    // QUERIES
    // ==========================================================================

    /// Bookings where the user is the patient or the provider, soonest first.
    #[instrument(skip(self))]
    pub async fn get_bookings_for_user(
        &self,
        user_id: Uuid,
        role: ActorRole,
        filter: Option<StatusFilter>,
    ) -> Result<Vec<Booking>, BookingError> {
        if role == ActorRole::System {
            return Err(BookingError::Unauthorized);
        }

        let now = self.now();
        let mut bookings: Vec<Booking> = self
            .store
            .list_for_user(user_id, role)
            .await?
            .into_iter()
            .filter(|booking| filter.map_or(true, |f| f.matches(booking, now)))
            .collect();
        bookings.sort_by_key(|booking| booking.requested.start);

        debug!("Found {} bookings for {} {}", bookings.len(), role, user_id);
        Ok(bookings)
    }

    pub async fn get_booking(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        self.store.get(booking_id).await
    }

    // ==========================================================================
    // MAINTENANCE
    // ==========================================================================

    /// Drop holds whose TTL passed. Returns how many were released.
    pub async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64, BookingError> {
        let released = self.ledger.release_expired(now).await?;
        for handle in &released {
            debug!("Reservation {} for provider {} expired", handle.id, handle.provider_id);
        }
        Ok(released.len() as u64)
    }

    /// Pending bookings whose provider response deadline has passed.
    pub async fn overdue_bookings(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, BookingError> {
        self.store.pending_past_deadline(now).await
    }

    /// Retry ledger releases that failed after their transition committed.
    /// Returns `(completed, still_failing)`.
    pub async fn retry_slot_cleanups(&self) -> (u64, u64) {
        let pending = std::mem::take(&mut *self.pending_cleanups.lock().await);
        let mut completed = 0;
        let mut failed = Vec::new();

        for cleanup in pending {
            match self.run_cleanup(&cleanup).await {
                Ok(_) => completed += 1,
                Err(e) => {
                    warn!("Deferred slot cleanup failed again: {}", e);
                    failed.push(cleanup);
                }
            }
        }

        let still_failing = failed.len() as u64;
        if !failed.is_empty() {
            self.pending_cleanups.lock().await.extend(failed);
        }
        (completed, still_failing)
    }

    pub async fn ledger_stats(&self) -> Result<LedgerStats, BookingError> {
        Ok(self.ledger.stats().await?)
    }

    // ==========================================================================
    // HELPERS
    // ==========================================================================

    async fn booking_lock(&self, booking_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.booking_locks.lock().await;
        locks.entry(booking_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Drop the lock entry once nobody else is waiting on it.
    async fn forget_lock(&self, booking_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.booking_locks.lock().await;
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&booking_id);
        }
    }

    fn recipients(booking: &Booking, event_type: BookingEventType, actor_role: ActorRole) -> Vec<Uuid> {
        match event_type {
            BookingEventType::Requested => vec![booking.provider_id],
            BookingEventType::Confirmed | BookingEventType::Declined | BookingEventType::RescheduleProposed => {
                vec![booking.patient_id]
            }
            BookingEventType::Rescheduled | BookingEventType::RescheduleDeclined => vec![booking.provider_id],
            BookingEventType::Cancelled => match actor_role {
                ActorRole::Patient => vec![booking.provider_id],
                ActorRole::Provider => vec![booking.patient_id],
                ActorRole::System => vec![booking.patient_id, booking.provider_id],
            },
            BookingEventType::Expired => vec![booking.patient_id, booking.provider_id],
        }
    }

    async fn notify(&self, booking: &Booking, event_type: BookingEventType, recipients: &[Uuid]) {
        let now = self.now();
        for recipient in recipients {
            let event = BookingEvent::new(event_type, booking.id, *recipient, now);
            if let Err(e) = self.collaborators.notifier.dispatch(event).await {
                warn!("Failed to dispatch {:?} for booking {}: {}", event_type, booking.id, e);
            }
        }
    }
}
