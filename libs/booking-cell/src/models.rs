// libs/booking-cell/src/models.rs
use chrono::{DateTime, Datelike, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::{Actor, ActorRole};

use crate::error::BookingError;

// ==============================================================================
// TIME RANGES
// ==============================================================================

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, BookingError> {
        if end <= start {
            return Err(BookingError::InvalidTimeRange(format!(
                "end {} must be after start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Adjacent ranges (one ends where the other starts) do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// ==============================================================================
// BOOKING STATUS & ACTIONS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingConfirmation,
    Confirmed,
    PendingPayment,
    Completed,
    NoShow,
    Cancelled,
    Declined,
    Expired,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 8] = [
        BookingStatus::PendingConfirmation,
        BookingStatus::Confirmed,
        BookingStatus::PendingPayment,
        BookingStatus::Completed,
        BookingStatus::NoShow,
        BookingStatus::Cancelled,
        BookingStatus::Declined,
        BookingStatus::Expired,
    ];

    /// Statuses that still occupy the provider's slot.
    pub fn is_active(&self) -> bool {
        matches!(self,
            BookingStatus::PendingConfirmation |
            BookingStatus::Confirmed |
            BookingStatus::PendingPayment
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingConfirmation => "pending_confirmation",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::PendingPayment => "pending_payment",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Declined => "declined",
            BookingStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BookingError::Storage(format!("Unknown booking status: {}", s)))
    }
}

/// Discriminant of a [`BookingAction`], recorded in the status history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Confirm,
    Decline,
    ProposeReschedule,
    AcceptReschedule,
    DeclineReschedule,
    Cancel,
    Expire,
    MarkCompleted,
    MarkNoShow,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Create => "create",
            ActionKind::Confirm => "confirm",
            ActionKind::Decline => "decline",
            ActionKind::ProposeReschedule => "propose_reschedule",
            ActionKind::AcceptReschedule => "accept_reschedule",
            ActionKind::DeclineReschedule => "decline_reschedule",
            ActionKind::Cancel => "cancel",
            ActionKind::Expire => "expire",
            ActionKind::MarkCompleted => "mark_completed",
            ActionKind::MarkNoShow => "mark_no_show",
        };
        f.write_str(name)
    }
}

/// An action requested against an existing booking, with its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BookingAction {
    Confirm,
    Decline { reason: Option<String> },
    ProposeReschedule { slot: TimeRange, message: Option<String> },
    AcceptReschedule,
    DeclineReschedule,
    Cancel { reason: Option<String> },
    Expire,
    MarkCompleted,
    MarkNoShow,
}

impl BookingAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            BookingAction::Confirm => ActionKind::Confirm,
            BookingAction::Decline { .. } => ActionKind::Decline,
            BookingAction::ProposeReschedule { .. } => ActionKind::ProposeReschedule,
            BookingAction::AcceptReschedule => ActionKind::AcceptReschedule,
            BookingAction::DeclineReschedule => ActionKind::DeclineReschedule,
            BookingAction::Cancel { .. } => ActionKind::Cancel,
            BookingAction::Expire => ActionKind::Expire,
            BookingAction::MarkCompleted => ActionKind::MarkCompleted,
            BookingAction::MarkNoShow => ActionKind::MarkNoShow,
        }
    }
}

// ==============================================================================
// BOOKING RECORD
// ==============================================================================

/// One entry of a booking's append-only status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub status: BookingStatus,
    pub action: ActionKind,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RescheduleProposal {
    pub proposed: TimeRange,
    pub proposed_by: ActorRole,
    pub proposed_at: DateTime<Utc>,
    pub message: Option<String>,
    /// Ledger hold protecting the proposed slot while the patient decides.
    pub hold_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RescheduleRecord {
    pub attempt: u32,
    pub from: TimeRange,
    pub to: TimeRange,
    pub proposed_by: ActorRole,
    pub proposed_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub accepted: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub booking_number: String,
    pub patient_id: Uuid,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub service_duration_minutes: i32,
    pub price_cents: i64,
    pub requested: TimeRange,
    pub status: BookingStatus,
    pub status_history: Vec<StatusChange>,
    pub reschedule_proposal: Option<RescheduleProposal>,
    pub reschedule_history: Vec<RescheduleRecord>,
    pub response_deadline: DateTime<Utc>,
    /// Ledger claim currently defending `requested`.
    pub slot_reservation_id: Uuid,
    pub cancelled_by: Option<ActorRole>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Build a new booking in `pending_confirmation`, snapshotting the service.
    pub fn new(
        id: Uuid,
        patient_id: Uuid,
        provider_id: Uuid,
        service: &ServiceInfo,
        requested: TimeRange,
        slot_reservation_id: Uuid,
        response_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            booking_number: generate_booking_number(now),
            patient_id,
            provider_id,
            service_id: service.id,
            service_duration_minutes: service.duration_minutes,
            price_cents: service.price_cents,
            requested,
            status: BookingStatus::PendingConfirmation,
            status_history: vec![StatusChange {
                status: BookingStatus::PendingConfirmation,
                action: ActionKind::Create,
                actor: Actor::patient(patient_id),
                at: now,
                reason: None,
            }],
            reschedule_proposal: None,
            reschedule_history: Vec::new(),
            response_deadline,
            slot_reservation_id,
            cancelled_by: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reschedule_count(&self) -> u32 {
        self.reschedule_history.len() as u32
    }

    pub fn last_change(&self) -> Option<&StatusChange> {
        self.status_history.last()
    }

    /// Whether `next` could legally replace `self` in storage: identity and
    /// snapshot fields untouched, history only appended to.
    pub fn is_valid_successor(&self, next: &Booking) -> bool {
        self.id == next.id
            && self.patient_id == next.patient_id
            && self.provider_id == next.provider_id
            && self.service_id == next.service_id
            && self.service_duration_minutes == next.service_duration_minutes
            && self.price_cents == next.price_cents
            && self.created_at == next.created_at
            && next.status_history.len() >= self.status_history.len()
            && next.status_history.starts_with(&self.status_history)
    }

    pub fn involves(&self, user_id: Uuid, role: ActorRole) -> bool {
        match role {
            ActorRole::Patient => self.patient_id == user_id,
            ActorRole::Provider => self.provider_id == user_id,
            ActorRole::System => false,
        }
    }
}

fn generate_booking_number(now: DateTime<Utc>) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("FH-{:02}{:02}-{}", now.month(), now.day(), suffix)
}

// ==============================================================================
// LISTING FILTERS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Exact(BookingStatus),
    /// Active bookings whose requested start is still in the future.
    Upcoming,
    Completed,
    Cancelled,
}

impl StatusFilter {
    pub fn matches(&self, booking: &Booking, now: DateTime<Utc>) -> bool {
        match self {
            StatusFilter::Exact(status) => booking.status == *status,
            StatusFilter::Upcoming => booking.status.is_active() && booking.requested.start > now,
            StatusFilter::Completed => matches!(booking.status,
                BookingStatus::Completed | BookingStatus::NoShow
            ),
            StatusFilter::Cancelled => matches!(booking.status,
                BookingStatus::Cancelled | BookingStatus::Declined | BookingStatus::Expired
            ),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "upcoming" => Ok(StatusFilter::Upcoming),
            // Group names win over the exact status of the same spelling.
            "completed" => Ok(StatusFilter::Completed),
            "cancelled" => Ok(StatusFilter::Cancelled),
            other => other
                .parse::<BookingStatus>()
                .map(StatusFilter::Exact)
                .map_err(|_| BookingError::InvalidStatusFilter(other.to_string())),
        }
    }
}

// ==============================================================================
// SLOT RESERVATIONS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SlotHolder {
    /// Transient token for a booking flow that has not been submitted yet.
    Request(Uuid),
    Booking(Uuid),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Held,
    Converted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    RequestAbandoned,
    BookingClosed,
    Rescheduled,
    ProposalWithdrawn,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReleaseReason::Expired => "expired",
            ReleaseReason::RequestAbandoned => "request_abandoned",
            ReleaseReason::BookingClosed => "booking_closed",
            ReleaseReason::Rescheduled => "rescheduled",
            ReleaseReason::ProposalWithdrawn => "proposal_withdrawn",
        };
        f.write_str(name)
    }
}

/// A live entry on a provider's timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotReservation {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub slot: TimeRange,
    pub held_by: SlotHolder,
    pub state: ReservationState,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub converted_at: Option<DateTime<Utc>>,
}

impl SlotReservation {
    /// Converted claims never lapse; holds lapse at `expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ReservationState::Converted => true,
            ReservationState::Held => self.expires_at > now,
        }
    }

    /// Whether this entry blocks `slot` for `requester`. A booking never
    /// conflicts with its own claims.
    pub fn blocks(&self, slot: &TimeRange, requester: &SlotHolder, now: DateTime<Utc>) -> bool {
        let same_booking = matches!(
            (requester, &self.held_by),
            (SlotHolder::Booking(a), SlotHolder::Booking(b)) if a == b
        );
        !same_booking && self.is_live(now) && self.slot.overlaps(slot)
    }

    pub fn handle(&self) -> ReservationHandle {
        ReservationHandle {
            id: self.id,
            provider_id: self.provider_id,
            slot: self.slot,
            holder: self.held_by,
            expires_at: self.expires_at,
        }
    }
}

/// Opaque reference to a ledger entry returned by `acquire`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReservationHandle {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub slot: TimeRange,
    pub holder: SlotHolder,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStats {
    pub active_holds: u64,
    pub converted_claims: u64,
}

// ==============================================================================
// EXTERNAL COLLABORATOR MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BookingPolicy {
    Instant,
    #[default]
    Request,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderInfo {
    pub id: Uuid,
    pub booking_policy: BookingPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    pub id: Uuid,
    pub provider_id: Option<Uuid>,
    pub duration_minutes: i32,
    pub price_cents: i64,
}

// ==============================================================================
// NOTIFICATION EVENTS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BookingEventType {
    #[serde(rename = "booking.requested")]
    Requested,
    #[serde(rename = "booking.confirmed")]
    Confirmed,
    #[serde(rename = "booking.declined")]
    Declined,
    #[serde(rename = "booking.reschedule_proposed")]
    RescheduleProposed,
    #[serde(rename = "booking.rescheduled")]
    Rescheduled,
    #[serde(rename = "booking.reschedule_declined")]
    RescheduleDeclined,
    #[serde(rename = "booking.cancelled")]
    Cancelled,
    #[serde(rename = "booking.expired")]
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingEvent {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: BookingEventType,
    pub booking_id: Uuid,
    pub recipient_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl BookingEvent {
    pub fn new(event_type: BookingEventType, booking_id: Uuid, recipient_id: Uuid, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            booking_id,
            recipient_id,
            occurred_at,
        }
    }
}

// ==============================================================================
// CONFIGURATION & REPORTING
// ==============================================================================

#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub response_deadline: Duration,
    pub reservation_ttl: Duration,
    pub reschedule_hold: Duration,
    pub max_reschedules: u32,
    pub max_retry_attempts: u32,
    pub sweep_interval: std::time::Duration,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for BookingConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            response_deadline: Duration::hours(config.response_deadline_hours),
            reservation_ttl: Duration::seconds(config.reservation_ttl_seconds),
            reschedule_hold: Duration::hours(config.reschedule_hold_hours),
            max_reschedules: config.max_reschedules,
            max_retry_attempts: config.max_retry_attempts.max(1),
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_seconds.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_released: u64,
    pub bookings_expired: u64,
    /// Deferred claim releases that went through on this cycle.
    pub cleanups_retried: u64,
    pub errors: u64,
}
