// libs/booking-cell/src/services/notifier.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::BookingEvent;

pub const OUTBOUND_QUEUE_KEY: &str = "booking_events:outbound";

/// Outbound side of booking events. Delivery is somebody else's job; the
/// orchestrator only hands events over after commit.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, event: BookingEvent) -> Result<()>;
}

/// In-process queue drained by whatever delivers notifications.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<BookingEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BookingEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationDispatcher for ChannelNotifier {
    async fn dispatch(&self, event: BookingEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| anyhow!("Notification channel closed"))
    }
}

/// Pushes events as JSON onto a Redis list for an external worker to pop.
pub struct RedisNotificationQueue {
    pool: Pool,
    queue_key: String,
}

impl RedisNotificationQueue {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            queue_key: OUTBOUND_QUEUE_KEY.to_string(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for RedisNotificationQueue {
    async fn dispatch(&self, event: BookingEvent) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(&event)?;

        let _: () = conn.lpush(&self.queue_key, payload).await?;

        debug!("Queued {:?} event {} for {}", event.event_type, event.event_id, event.recipient_id);
        Ok(())
    }
}
