use thiserror::Error;
use uuid::Uuid;

use crate::models::{ActionKind, BookingStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookingError {
    #[error("Requested slot is not available")]
    SlotUnavailable,

    #[error("Action {action} is not valid for a booking in status {status}")]
    InvalidTransition { status: BookingStatus, action: ActionKind },

    #[error("Actor is not authorized to perform this booking action")]
    Unauthorized,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Booking {0} was modified concurrently, retry the action")]
    ConcurrentModification(Uuid),

    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("Unknown status filter: {0}")]
    InvalidStatusFilter(String),

    #[error("Maximum of {max} reschedule proposals reached")]
    RescheduleLimitReached { max: u32 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("External service error: {0}")]
    Collaborator(String),
}

impl BookingError {
    pub fn booking_not_found(id: Uuid) -> Self {
        BookingError::NotFound { entity: "booking", id }
    }

    /// Whether the orchestrator may retry the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::ConcurrentModification(_))
    }
}

impl From<redis::RedisError> for BookingError {
    fn from(err: redis::RedisError) -> Self {
        BookingError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BookingError {
    fn from(err: serde_json::Error) -> Self {
        BookingError::Storage(format!("Serialization error: {}", err))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Slot overlaps an existing reservation for provider {provider_id}")]
    Conflict { provider_id: Uuid },

    #[error("Reservation {0} is no longer held")]
    ReservationLost(Uuid),

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl From<redis::RedisError> for LedgerError {
    fn from(err: redis::RedisError) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Storage(format!("Serialization error: {}", err))
    }
}

impl From<LedgerError> for BookingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Conflict { .. } | LedgerError::ReservationLost(_) => BookingError::SlotUnavailable,
            LedgerError::Storage(msg) => BookingError::Storage(msg),
        }
    }
}
