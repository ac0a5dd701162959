// libs/booking-cell/src/services/state_machine.rs
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use shared_models::{Actor, ActorRole};

use crate::error::BookingError;
use crate::models::{
    ActionKind, Booking, BookingAction, BookingEventType, BookingStatus, RescheduleProposal,
    RescheduleRecord, StatusChange, TimeRange,
};

/// Inputs the transition function needs beyond the booking itself.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    pub payment_settled: bool,
    pub max_reschedules: u32,
}

/// Ledger work the orchestrator must perform alongside a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEffect {
    None,
    /// Hold the proposed slot before the proposal is committed.
    HoldProposal(TimeRange),
    /// Turn the proposal hold into the booking's claim, then drop the old claim.
    SwapToProposal {
        slot: TimeRange,
        hold_id: Option<Uuid>,
        previous_claim: Uuid,
    },
    /// Drop the proposal hold, keep the current claim.
    ReleaseProposal(Option<Uuid>),
    /// Booking left the active set; drop every ledger entry it holds.
    ReleaseAll,
}

#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub booking: Booking,
    pub slot_effect: SlotEffect,
    pub notification: Option<BookingEventType>,
}

#[derive(Debug, Clone)]
pub enum Transition {
    /// The same action was the last one applied; nothing to do.
    AlreadyApplied,
    Applied(AppliedTransition),
}

/// The single authoritative transition function for bookings. Pure: it never
/// touches the ledger, the store or the clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct BookingStateMachine;

impl BookingStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Roles allowed to request each action.
    pub fn is_permitted(role: ActorRole, action: ActionKind) -> bool {
        match action {
            ActionKind::Create => role == ActorRole::Patient,
            ActionKind::Confirm | ActionKind::Decline | ActionKind::ProposeReschedule => {
                role == ActorRole::Provider
            }
            ActionKind::AcceptReschedule | ActionKind::DeclineReschedule => role == ActorRole::Patient,
            ActionKind::Cancel => matches!(role, ActorRole::Patient | ActorRole::Provider),
            ActionKind::Expire | ActionKind::MarkCompleted | ActionKind::MarkNoShow => {
                role == ActorRole::System
            }
        }
    }

    pub fn apply(
        &self,
        booking: &Booking,
        actor: &Actor,
        action: &BookingAction,
        ctx: &TransitionContext,
    ) -> Result<Transition, BookingError> {
        let kind = action.kind();

        if !Self::is_permitted(actor.role, kind) {
            warn!("Role {} may not {} booking {}", actor.role, kind, booking.id);
            return Err(BookingError::Unauthorized);
        }

        if Self::is_replay(booking, actor, action) {
            debug!("Action {} already applied to booking {}", kind, booking.id);
            return Ok(Transition::AlreadyApplied);
        }

        let invalid = || BookingError::InvalidTransition { status: booking.status, action: kind };
        let mut next = booking.clone();

        let (status, reason, slot_effect, notification) = match action {
            BookingAction::Confirm => {
                if booking.status != BookingStatus::PendingConfirmation || booking.reschedule_proposal.is_some() {
                    return Err(invalid());
                }
                (BookingStatus::Confirmed, None, SlotEffect::None, Some(BookingEventType::Confirmed))
            }

            BookingAction::Decline { reason } => {
                if booking.status != BookingStatus::PendingConfirmation {
                    return Err(invalid());
                }
                Self::close_proposal(&mut next, None, ctx.now);
                next.cancelled_by = Some(actor.role);
                (BookingStatus::Declined, reason.clone(), SlotEffect::ReleaseAll, Some(BookingEventType::Declined))
            }

            BookingAction::ProposeReschedule { slot, message } => {
                if !matches!(booking.status, BookingStatus::PendingConfirmation | BookingStatus::Confirmed)
                    || booking.reschedule_proposal.is_some()
                {
                    return Err(invalid());
                }
                if booking.reschedule_count() >= ctx.max_reschedules {
                    return Err(BookingError::RescheduleLimitReached { max: ctx.max_reschedules });
                }
                if slot.start <= ctx.now {
                    return Err(BookingError::InvalidTimeRange(format!(
                        "proposed slot {} starts in the past",
                        slot
                    )));
                }
                if *slot == booking.requested {
                    return Err(BookingError::InvalidTimeRange(
                        "proposed slot matches the current booking".to_string(),
                    ));
                }

                next.reschedule_history.push(RescheduleRecord {
                    attempt: booking.reschedule_count() + 1,
                    from: booking.requested,
                    to: *slot,
                    proposed_by: actor.role,
                    proposed_at: ctx.now,
                    responded_at: None,
                    accepted: None,
                });
                next.reschedule_proposal = Some(RescheduleProposal {
                    proposed: *slot,
                    proposed_by: actor.role,
                    proposed_at: ctx.now,
                    message: message.clone(),
                    hold_id: None,
                });
                (
                    booking.status,
                    message.clone(),
                    SlotEffect::HoldProposal(*slot),
                    Some(BookingEventType::RescheduleProposed),
                )
            }

            BookingAction::AcceptReschedule => {
                let proposal = match &booking.reschedule_proposal {
                    Some(proposal) if booking.status.is_active() => proposal.clone(),
                    _ => return Err(invalid()),
                };
                Self::close_proposal(&mut next, Some(true), ctx.now);
                next.requested = proposal.proposed;
                (
                    BookingStatus::Confirmed,
                    None,
                    SlotEffect::SwapToProposal {
                        slot: proposal.proposed,
                        hold_id: proposal.hold_id,
                        previous_claim: booking.slot_reservation_id,
                    },
                    Some(BookingEventType::Rescheduled),
                )
            }

            BookingAction::DeclineReschedule => {
                let hold_id = match &booking.reschedule_proposal {
                    Some(proposal) if booking.status.is_active() => proposal.hold_id,
                    _ => return Err(invalid()),
                };
                Self::close_proposal(&mut next, Some(false), ctx.now);
                (
                    booking.status,
                    None,
                    SlotEffect::ReleaseProposal(hold_id),
                    Some(BookingEventType::RescheduleDeclined),
                )
            }

            BookingAction::Cancel { reason } => {
                if booking.status.is_terminal() {
                    return Err(invalid());
                }
                Self::close_proposal(&mut next, None, ctx.now);
                next.cancelled_by = Some(actor.role);
                (BookingStatus::Cancelled, reason.clone(), SlotEffect::ReleaseAll, Some(BookingEventType::Cancelled))
            }

            BookingAction::Expire => {
                if booking.status != BookingStatus::PendingConfirmation || ctx.now < booking.response_deadline {
                    return Err(invalid());
                }
                Self::close_proposal(&mut next, None, ctx.now);
                next.cancelled_by = Some(ActorRole::System);
                (
                    BookingStatus::Expired,
                    Some("provider did not respond before the deadline".to_string()),
                    SlotEffect::ReleaseAll,
                    Some(BookingEventType::Expired),
                )
            }

            BookingAction::MarkCompleted => {
                if ctx.now < booking.requested.end {
                    return Err(invalid());
                }
                match (booking.status, ctx.payment_settled) {
                    (BookingStatus::Confirmed | BookingStatus::PendingPayment, true) => {
                        Self::close_proposal(&mut next, None, ctx.now);
                        (BookingStatus::Completed, None, SlotEffect::ReleaseAll, None)
                    }
                    (BookingStatus::Confirmed, false) => {
                        let hold_id = next.reschedule_proposal.as_ref().and_then(|p| p.hold_id);
                        let effect = if next.reschedule_proposal.is_some() {
                            SlotEffect::ReleaseProposal(hold_id)
                        } else {
                            SlotEffect::None
                        };
                        Self::close_proposal(&mut next, None, ctx.now);
                        (
                            BookingStatus::PendingPayment,
                            Some("awaiting payment settlement".to_string()),
                            effect,
                            None,
                        )
                    }
                    _ => return Err(invalid()),
                }
            }

            BookingAction::MarkNoShow => {
                if booking.status != BookingStatus::Confirmed || ctx.now < booking.requested.end {
                    return Err(invalid());
                }
                Self::close_proposal(&mut next, None, ctx.now);
                (BookingStatus::NoShow, None, SlotEffect::ReleaseAll, None)
            }
        };

        next.status = status;
        next.updated_at = ctx.now;
        next.status_history.push(StatusChange {
            status,
            action: kind,
            actor: *actor,
            at: ctx.now,
            reason,
        });

        debug!(
            "Booking {} transition {} -> {} via {}",
            booking.id, booking.status, next.status, kind
        );

        Ok(Transition::Applied(AppliedTransition {
            booking: next,
            slot_effect,
            notification,
        }))
    }

    /// Instant-book providers skip the confirmation step. Adds a System
    /// `confirm` entry so the history still records how the booking got here.
    pub fn auto_confirm(&self, booking: &mut Booking, now: DateTime<Utc>) {
        booking.status = BookingStatus::Confirmed;
        booking.updated_at = now;
        booking.status_history.push(StatusChange {
            status: BookingStatus::Confirmed,
            action: ActionKind::Confirm,
            actor: Actor::system(),
            at: now,
            reason: Some("instant booking".to_string()),
        });
    }

    /// The last recorded action equals the requested one and the booking is
    /// already in the state that action produces.
    fn is_replay(booking: &Booking, actor: &Actor, action: &BookingAction) -> bool {
        let last = match booking.last_change() {
            Some(last) => last,
            None => return false,
        };
        if last.action != action.kind() || last.actor.role != actor.role {
            return false;
        }

        match action {
            BookingAction::Confirm => booking.status == BookingStatus::Confirmed,
            BookingAction::Decline { .. } => booking.status == BookingStatus::Declined,
            BookingAction::ProposeReschedule { slot, .. } => booking
                .reschedule_proposal
                .as_ref()
                .map(|p| p.proposed == *slot)
                .unwrap_or(false),
            BookingAction::AcceptReschedule => {
                booking.reschedule_proposal.is_none() && booking.status == BookingStatus::Confirmed
            }
            BookingAction::DeclineReschedule => booking.reschedule_proposal.is_none(),
            BookingAction::Cancel { .. } => booking.status == BookingStatus::Cancelled,
            BookingAction::Expire => booking.status == BookingStatus::Expired,
            BookingAction::MarkCompleted => booking.status == BookingStatus::Completed,
            BookingAction::MarkNoShow => booking.status == BookingStatus::NoShow,
        }
    }

    /// Clear a pending proposal and stamp its history record.
    fn close_proposal(booking: &mut Booking, accepted: Option<bool>, now: DateTime<Utc>) {
        if booking.reschedule_proposal.take().is_none() {
            return;
        }
        if let Some(record) = booking.reschedule_history.last_mut() {
            if record.responded_at.is_none() {
                record.responded_at = Some(now);
                record.accepted = accepted;
            }
        }
    }
}
