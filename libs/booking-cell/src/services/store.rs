// libs/booking-cell/src/services/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_models::ActorRole;

use crate::error::BookingError;
use crate::models::{Booking, BookingStatus};

/// Durable booking records. `update` is a compare-and-set on `version`.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert(&self, booking: &Booking) -> Result<(), BookingError>;

    async fn get(&self, booking_id: Uuid) -> Result<Booking, BookingError>;

    /// Persist `booking` if the stored version still equals
    /// `expected_version`. Returns the stored record with its version bumped.
    async fn update(&self, booking: &Booking, expected_version: u64) -> Result<Booking, BookingError>;

    async fn list_for_user(&self, user_id: Uuid, role: ActorRole) -> Result<Vec<Booking>, BookingError>;

    /// Ids of `pending_confirmation` bookings whose response deadline passed.
    async fn pending_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, BookingError>;
}

#[derive(Default)]
pub struct InMemoryBookingStore {
    bookings: RwLock<HashMap<Uuid, Booking>>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.bookings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bookings.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Booking> {
        self.bookings.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<(), BookingError> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&booking.id) {
            return Err(BookingError::Storage(format!("Booking {} already exists", booking.id)));
        }
        bookings.insert(booking.id, booking.clone());
        debug!("Inserted booking {}", booking.id);
        Ok(())
    }

    async fn get(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        self.bookings
            .read()
            .await
            .get(&booking_id)
            .cloned()
            .ok_or_else(|| BookingError::booking_not_found(booking_id))
    }

    async fn update(&self, booking: &Booking, expected_version: u64) -> Result<Booking, BookingError> {
        let mut bookings = self.bookings.write().await;
        let current = bookings
            .get(&booking.id)
            .ok_or_else(|| BookingError::booking_not_found(booking.id))?;

        if current.version != expected_version {
            debug!(
                "Version mismatch on booking {}: stored {}, expected {}",
                booking.id, current.version, expected_version
            );
            return Err(BookingError::ConcurrentModification(booking.id));
        }
        if !current.is_valid_successor(booking) {
            warn!("Rejected update to booking {} that rewrites immutable fields", booking.id);
            return Err(BookingError::Storage(format!(
                "Update to booking {} rewrites snapshot fields or history",
                booking.id
            )));
        }

        let mut stored = booking.clone();
        stored.version = expected_version + 1;
        bookings.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_for_user(&self, user_id: Uuid, role: ActorRole) -> Result<Vec<Booking>, BookingError> {
        Ok(self
            .bookings
            .read()
            .await
            .values()
            .filter(|booking| booking.involves(user_id, role))
            .cloned()
            .collect())
    }

    async fn pending_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, BookingError> {
        Ok(self
            .bookings
            .read()
            .await
            .values()
            .filter(|b| b.status == BookingStatus::PendingConfirmation && b.response_deadline <= now)
            .map(|b| b.id)
            .collect())
    }
}
