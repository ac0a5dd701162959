// libs/booking-cell/src/services/sweeper.rs
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use shared_models::{ActorRole, SYSTEM_ACTOR_ID};

use crate::error::BookingError;
use crate::models::{BookingAction, SweepReport};
use crate::services::orchestrator::BookingOrchestrator;

/// Periodic cleanup of lapsed holds and unanswered booking requests.
/// Goes through the orchestrator for everything, so several instances can
/// sweep at once.
pub struct ExpirationSweeper {
    orchestrator: Arc<BookingOrchestrator>,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(orchestrator: Arc<BookingOrchestrator>) -> Self {
        let interval = orchestrator.config().sweep_interval;
        Self { orchestrator, interval }
    }

    pub fn with_interval(orchestrator: Arc<BookingOrchestrator>, interval: Duration) -> Self {
        Self { orchestrator, interval }
    }

    /// One sweep cycle. Individual failures are counted, never propagated.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        match self.orchestrator.release_expired_reservations(now).await {
            Ok(released) => report.reservations_released = released,
            Err(e) => {
                error!("Failed to release expired reservations: {}", e);
                report.errors += 1;
            }
        }

        let (retried, still_failing) = self.orchestrator.retry_slot_cleanups().await;
        report.cleanups_retried = retried;
        report.errors += still_failing;

        let overdue = match self.orchestrator.overdue_bookings(now).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to list overdue bookings: {}", e);
                report.errors += 1;
                Vec::new()
            }
        };

        for booking_id in overdue {
            match self
                .orchestrator
                .apply_action(booking_id, SYSTEM_ACTOR_ID, ActorRole::System, BookingAction::Expire)
                .await
            {
                Ok(_) => report.bookings_expired += 1,
                // Another instance or the provider got there first.
                Err(BookingError::InvalidTransition { .. }) => {
                    debug!("Booking {} no longer pending, skipping expiry", booking_id);
                }
                Err(e) => {
                    warn!("Failed to expire booking {}: {}", booking_id, e);
                    report.errors += 1;
                }
            }
        }

        match self.orchestrator.ledger_stats().await {
            Ok(stats) => debug!(
                "Ledger: {} active holds, {} converted claims",
                stats.active_holds, stats.converted_claims
            ),
            Err(e) => warn!("Failed to read ledger stats: {}", e),
        }

        if report != SweepReport::default() {
            info!(
                "Sweep finished in {:?}: {} reservations released, {} bookings expired, {} cleanups retried, {} errors",
                started.elapsed(),
                report.reservations_released,
                report.bookings_expired,
                report.cleanups_retried,
                report.errors
            );
        }

        report
    }

    /// Sweep on a fixed interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Expiration sweeper started, interval {:?}", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.orchestrator.now();
                    self.sweep_once(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Expiration sweeper stopped");
    }
}
