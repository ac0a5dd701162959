use std::sync::Arc;
use anyhow::Result;
use deadpool_redis::Runtime;
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use booking_cell::{
    BookingConfig, BookingOrchestrator, BookingStore, ChannelNotifier, Clock, Collaborators,
    ExpirationSweeper, InMemoryBookingStore, InMemoryReservationLedger, NotificationDispatcher,
    RedisBookingStore, RedisNotificationQueue, RedisReservationLedger, ReservationLedger,
    RestPaymentGateway, RestProviderDirectory, StaticPaymentGateway, StaticProviderDirectory,
    SystemClock,
};
use shared_config::AppConfig;
use shared_database::RestClient;

type Backends = (
    Arc<dyn ReservationLedger>,
    Arc<dyn BookingStore>,
    Arc<dyn NotificationDispatcher>,
);

#[tokio::main]
async fn main() -> Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,booking_cell=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting booking engine");

    // Load configuration
    let config = AppConfig::from_env();
    let booking_config = BookingConfig::from(&config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (ledger, store, notifier) = build_backends(&config, clock.clone()).await?;
    let collaborators = build_collaborators(&config, notifier);

    let orchestrator = Arc::new(BookingOrchestrator::new(
        ledger,
        store,
        collaborators,
        clock,
        booking_config,
    ));

    // Run the sweeper until Ctrl-C
    let sweeper = ExpirationSweeper::new(orchestrator.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping sweeper");

    shutdown_tx.send(true)?;
    sweeper_handle.await?;

    info!("Booking engine stopped");
    Ok(())
}

async fn build_backends(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Backends> {
    match &config.redis_url {
        Some(redis_url) => {
            info!("Using Redis ledger, store and outbound queue");
            let ledger = RedisReservationLedger::connect(redis_url, clock).await?;
            let store = RedisBookingStore::connect(redis_url).await?;
            let pool = deadpool_redis::Config::from_url(redis_url.as_str())
                .create_pool(Some(Runtime::Tokio1))?;

            Ok((Arc::new(ledger), Arc::new(store), Arc::new(RedisNotificationQueue::new(pool))))
        }
        None => {
            warn!("REDIS_URL not set, bookings live in this process only");
            let (notifier, mut events) = ChannelNotifier::new();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    info!(
                        "Outbound {:?} for booking {} to {}",
                        event.event_type, event.booking_id, event.recipient_id
                    );
                }
            });

            Ok((
                Arc::new(InMemoryReservationLedger::new(clock)),
                Arc::new(InMemoryBookingStore::new()),
                Arc::new(notifier),
            ))
        }
    }
}

fn build_collaborators(config: &AppConfig, notifier: Arc<dyn NotificationDispatcher>) -> Collaborators {
    if config.is_directory_configured() {
        info!("Using provider directory at {}", config.directory_url);
        Collaborators {
            directory: Arc::new(RestProviderDirectory::new(RestClient::new(config))),
            payments: Arc::new(RestPaymentGateway::new(RestClient::new(config))),
            notifier,
        }
    } else {
        warn!("Provider directory not configured, every lookup will miss");
        Collaborators {
            directory: Arc::new(StaticProviderDirectory::new()),
            payments: Arc::new(StaticPaymentGateway::new()),
            notifier,
        }
    }
}
