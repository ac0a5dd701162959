// libs/booking-cell/src/services/ledger.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LedgerError;
use crate::models::{
    LedgerStats, ReleaseReason, ReservationHandle, ReservationState, SlotHolder, SlotReservation,
    TimeRange,
};

/// Exclusive claims on provider time. Every implementation must make the
/// overlap check and the insert of `acquire` a single atomic step per
/// provider.
#[async_trait]
pub trait ReservationLedger: Send + Sync {
    /// Hold `slot` for `ttl`. Fails with `Conflict` if any live entry of the
    /// same provider overlaps it, other than entries of the same booking.
    async fn acquire(
        &self,
        provider_id: Uuid,
        slot: TimeRange,
        ttl: Duration,
        holder: SlotHolder,
    ) -> Result<ReservationHandle, LedgerError>;

    /// Drop an entry the handle's holder still owns. Returns whether anything
    /// was removed; missing, expired, released or re-owned entries are not an
    /// error. A promoted claim only goes through a handle of its booking.
    async fn release(&self, handle: &ReservationHandle, reason: ReleaseReason) -> Result<bool, LedgerError>;

    /// Convert a live hold into a claim owned by `booking_id` that no longer
    /// expires. Promoting an entry the booking already owns is a no-op.
    async fn promote(&self, handle: &ReservationHandle, booking_id: Uuid) -> Result<ReservationHandle, LedgerError>;

    /// Drop every entry held by `booking_id` on the provider's timeline.
    async fn release_holder(
        &self,
        provider_id: Uuid,
        booking_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<u64, LedgerError>;

    /// Remove holds whose TTL passed at `now` and return them.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<ReservationHandle>, LedgerError>;

    async fn stats(&self) -> Result<LedgerStats, LedgerError>;
}

type Timeline = Arc<Mutex<Vec<SlotReservation>>>;

/// Process-local ledger. Each provider's timeline sits behind its own mutex,
/// so different providers never contend.
pub struct InMemoryReservationLedger {
    timelines: RwLock<HashMap<Uuid, Timeline>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryReservationLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            timelines: RwLock::new(HashMap::new()),
            clock,
        }
    }

    async fn timeline(&self, provider_id: Uuid) -> Timeline {
        if let Some(timeline) = self.timelines.read().await.get(&provider_id) {
            return timeline.clone();
        }

        let mut timelines = self.timelines.write().await;
        timelines
            .entry(provider_id)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    async fn existing_timeline(&self, provider_id: Uuid) -> Option<Timeline> {
        self.timelines.read().await.get(&provider_id).cloned()
    }

    /// Live entries for a provider, for inspection in tests and diagnostics.
    pub async fn entries(&self, provider_id: Uuid) -> Vec<SlotReservation> {
        let now = self.clock.now();
        match self.existing_timeline(provider_id).await {
            Some(timeline) => timeline
                .lock()
                .await
                .iter()
                .filter(|entry| entry.is_live(now))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl ReservationLedger for InMemoryReservationLedger {
    async fn acquire(
        &self,
        provider_id: Uuid,
        slot: TimeRange,
        ttl: Duration,
        holder: SlotHolder,
    ) -> Result<ReservationHandle, LedgerError> {
        let timeline = self.timeline(provider_id).await;
        let mut entries = timeline.lock().await;
        let now = self.clock.now();

        if let Some(existing) = entries.iter().find(|entry| entry.blocks(&slot, &holder, now)) {
            debug!(
                "Slot {} for provider {} conflicts with reservation {}",
                slot, provider_id, existing.id
            );
            return Err(LedgerError::Conflict { provider_id });
        }

        let reservation = SlotReservation {
            id: Uuid::new_v4(),
            provider_id,
            slot,
            held_by: holder,
            state: ReservationState::Held,
            expires_at: now + ttl,
            created_at: now,
            converted_at: None,
        };
        let handle = reservation.handle();
        entries.push(reservation);

        debug!("Reservation {} held for provider {} at {}", handle.id, provider_id, slot);
        Ok(handle)
    }

    async fn release(&self, handle: &ReservationHandle, reason: ReleaseReason) -> Result<bool, LedgerError> {
        let timeline = match self.existing_timeline(handle.provider_id).await {
            Some(timeline) => timeline,
            None => return Ok(false),
        };
        let mut entries = timeline.lock().await;

        let before = entries.len();
        entries.retain(|entry| entry.id != handle.id || entry.held_by != handle.holder);
        let removed = entries.len() != before;

        if removed {
            debug!("Reservation {} released ({})", handle.id, reason);
        } else {
            debug!("Reservation {} not released, gone or owned by someone else", handle.id);
        }
        Ok(removed)
    }

    async fn promote(&self, handle: &ReservationHandle, booking_id: Uuid) -> Result<ReservationHandle, LedgerError> {
        let timeline = self
            .existing_timeline(handle.provider_id)
            .await
            .ok_or(LedgerError::ReservationLost(handle.id))?;
        let mut entries = timeline.lock().await;
        let now = self.clock.now();
        let owner = SlotHolder::Booking(booking_id);

        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == handle.id)
            .ok_or(LedgerError::ReservationLost(handle.id))?;

        match entry.state {
            ReservationState::Converted if entry.held_by == owner => return Ok(entry.handle()),
            ReservationState::Converted => return Err(LedgerError::ReservationLost(handle.id)),
            ReservationState::Held => {}
        }

        if entry.held_by != handle.holder {
            return Err(LedgerError::ReservationLost(handle.id));
        }
        if entry.expires_at <= now {
            warn!("Reservation {} expired before it could be promoted", handle.id);
            return Err(LedgerError::ReservationLost(handle.id));
        }
        if matches!(entry.held_by, SlotHolder::Booking(other) if other != booking_id) {
            return Err(LedgerError::ReservationLost(handle.id));
        }

        entry.state = ReservationState::Converted;
        entry.held_by = owner;
        entry.converted_at = Some(now);

        debug!("Reservation {} promoted for booking {}", handle.id, booking_id);
        Ok(entry.handle())
    }

    async fn release_holder(
        &self,
        provider_id: Uuid,
        booking_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<u64, LedgerError> {
        let timeline = match self.existing_timeline(provider_id).await {
            Some(timeline) => timeline,
            None => return Ok(0),
        };
        let mut entries = timeline.lock().await;
        let owner = SlotHolder::Booking(booking_id);

        let before = entries.len();
        entries.retain(|entry| entry.held_by != owner);
        let removed = (before - entries.len()) as u64;

        if removed > 0 {
            debug!("Released {} reservations of booking {} ({})", removed, booking_id, reason);
        }
        Ok(removed)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<ReservationHandle>, LedgerError> {
        let timelines: Vec<Timeline> = self.timelines.read().await.values().cloned().collect();
        let mut released = Vec::new();

        for timeline in timelines {
            let mut entries = timeline.lock().await;
            entries.retain(|entry| {
                if entry.is_live(now) {
                    true
                } else {
                    released.push(entry.handle());
                    false
                }
            });
        }

        if !released.is_empty() {
            info!("Released {} expired reservations", released.len());
        }
        Ok(released)
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let timelines: Vec<Timeline> = self.timelines.read().await.values().cloned().collect();
        let now = self.clock.now();
        let mut stats = LedgerStats::default();

        for timeline in timelines {
            for entry in timeline.lock().await.iter() {
                match entry.state {
                    ReservationState::Held if entry.expires_at > now => stats.active_holds += 1,
                    ReservationState::Held => {}
                    ReservationState::Converted => stats.converted_claims += 1,
                }
            }
        }

        Ok(stats)
    }
}
