// libs/booking-cell/src/services/redis_store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_models::ActorRole;

use crate::error::BookingError;
use crate::models::Booking;
use crate::services::store::BookingStore;

const PENDING_DEADLINES_KEY: &str = "bookings:pending_deadlines";

const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', ARGV[2], 'status', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[4])
if ARGV[3] == 'pending_confirmation' then
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[4])
end
return 1
"#;

// -1 missing, 0 version mismatch, 1 written.
const UPDATE_SCRIPT: &str = r#"
local version = redis.call('HGET', KEYS[1], 'version')
if not version then return -1 end
if version ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'version', ARGV[3], 'status', ARGV[4])
if ARGV[4] == 'pending_confirmation' then
  redis.call('ZADD', KEYS[2], ARGV[6], ARGV[5])
else
  redis.call('ZREM', KEYS[2], ARGV[5])
end
return 1
"#;

/// Bookings as JSON documents in Redis hashes, with per-user index sets and
/// a deadline index for the sweeper.
pub struct RedisBookingStore {
    pool: Pool,
    insert_script: Script,
    update_script: Script,
}

impl RedisBookingStore {
    pub async fn connect(redis_url: &str) -> Result<Self, BookingError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BookingError::Storage(format!("Pool creation error: {}", e)))?;

        let store = Self::new(pool);
        let mut conn = store.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis booking store initialized");

        Ok(store)
    }

    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            insert_script: Script::new(INSERT_SCRIPT),
            update_script: Script::new(UPDATE_SCRIPT),
        }
    }

    fn booking_key(booking_id: Uuid) -> String {
        format!("booking:{}", booking_id)
    }

    fn user_key(role: ActorRole, user_id: Uuid) -> String {
        format!("bookings:{}:{}", role, user_id)
    }

    async fn connection(&self) -> Result<Connection, BookingError> {
        self.pool
            .get()
            .await
            .map_err(|e| BookingError::Storage(format!("Failed to get Redis connection: {}", e)))
    }

    async fn load(conn: &mut Connection, booking_id: Uuid) -> Result<Option<Booking>, BookingError> {
        let (data, version): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(Self::booking_key(booking_id))
            .arg("data")
            .arg("version")
            .query_async(conn)
            .await?;

        match (data, version) {
            (Some(data), Some(version)) => {
                let mut booking: Booking = serde_json::from_str(&data)?;
                booking.version = version;
                Ok(Some(booking))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl BookingStore for RedisBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<(), BookingError> {
        let mut conn = self.connection().await?;

        let inserted: i64 = self
            .insert_script
            .key(Self::booking_key(booking.id))
            .key(Self::user_key(ActorRole::Patient, booking.patient_id))
            .key(Self::user_key(ActorRole::Provider, booking.provider_id))
            .key(PENDING_DEADLINES_KEY)
            .arg(serde_json::to_string(booking)?)
            .arg(booking.version)
            .arg(booking.status.as_str())
            .arg(booking.id.to_string())
            .arg(booking.response_deadline.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if inserted == 0 {
            return Err(BookingError::Storage(format!("Booking {} already exists", booking.id)));
        }

        debug!("Inserted booking {}", booking.id);
        Ok(())
    }

    async fn get(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        let mut conn = self.connection().await?;
        Self::load(&mut conn, booking_id)
            .await?
            .ok_or_else(|| BookingError::booking_not_found(booking_id))
    }

    async fn update(&self, booking: &Booking, expected_version: u64) -> Result<Booking, BookingError> {
        let mut conn = self.connection().await?;

        let current = Self::load(&mut conn, booking.id)
            .await?
            .ok_or_else(|| BookingError::booking_not_found(booking.id))?;
        if current.version != expected_version {
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

        let outcome: i64 = self
            .update_script
            .key(Self::booking_key(booking.id))
            .key(PENDING_DEADLINES_KEY)
            .arg(expected_version)
            .arg(serde_json::to_string(&stored)?)
            .arg(stored.version)
            .arg(stored.status.as_str())
            .arg(stored.id.to_string())
            .arg(stored.response_deadline.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(stored),
            0 => Err(BookingError::ConcurrentModification(booking.id)),
            _ => Err(BookingError::booking_not_found(booking.id)),
        }
    }

    async fn list_for_user(&self, user_id: Uuid, role: ActorRole) -> Result<Vec<Booking>, BookingError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(Self::user_key(role, user_id)).await?;

        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            let booking_id = match Uuid::parse_str(&id) {
                Ok(booking_id) => booking_id,
                Err(_) => {
                    warn!("Skipping malformed booking id {} in index", id);
                    continue;
                }
            };
            if let Some(booking) = Self::load(&mut conn, booking_id).await? {
                bookings.push(booking);
            }
        }

        Ok(bookings)
    }

    async fn pending_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, BookingError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(PENDING_DEADLINES_KEY, "-inf", now.timestamp_millis())
            .await?;

        Ok(ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
    }
}
