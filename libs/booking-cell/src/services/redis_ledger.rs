// libs/booking-cell/src/services/redis_ledger.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LedgerError;
use crate::models::{LedgerStats, ReleaseReason, ReservationHandle, SlotHolder, TimeRange};
use crate::services::ledger::ReservationLedger;

const HOLDS_KEY: &str = "slot_ledger:holds";
const STATS_KEY: &str = "slot_ledger:stats";

// Check-and-insert over one provider's hash. Returns 0 on overlap.
const ACQUIRE_SCRIPT: &str = r#"
local now = tonumber(ARGV[3])
local start_ms = tonumber(ARGV[4])
local end_ms = tonumber(ARGV[5])
local holder_kind = ARGV[6]
local holder_id = ARGV[7]
local entries = redis.call('HGETALL', KEYS[1])
for i = 1, #entries, 2 do
  local e = cjson.decode(entries[i + 1])
  local live = e.state == 'converted' or tonumber(e.expires_ms) > now
  local same = holder_kind == 'booking' and e.holder_kind == 'booking' and e.holder_id == holder_id
  if live and not same and tonumber(e.start_ms) < end_ms and start_ms < tonumber(e.end_ms) then
    return 0
  end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[8], ARGV[9])
return 1
"#;

// 1 promoted, 2 already owned by the booking, 0 lost.
const PROMOTE_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then return 0 end
local e = cjson.decode(raw)
if e.state == 'converted' then
  if e.holder_kind == 'booking' and e.holder_id == ARGV[2] then return 2 end
  return 0
end
if e.holder_kind ~= ARGV[6] or e.holder_id ~= ARGV[7] then return 0 end
if tonumber(e.expires_ms) <= tonumber(ARGV[3]) then return 0 end
if e.holder_kind == 'booking' and e.holder_id ~= ARGV[2] then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
redis.call('ZREM', KEYS[2], ARGV[5])
redis.call('HINCRBY', KEYS[3], 'converted_claims', 1)
return 1
"#;

// Removes the entry only while the handle's holder still owns it.
const RELEASE_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  redis.call('ZREM', KEYS[2], ARGV[2])
  return 0
end
local e = cjson.decode(raw)
if e.holder_kind ~= ARGV[3] or e.holder_id ~= ARGV[4] then return 0 end
redis.call('ZREM', KEYS[2], ARGV[2])
if e.state == 'converted' then
  redis.call('HINCRBY', KEYS[3], 'converted_claims', -1)
end
redis.call('HDEL', KEYS[1], ARGV[1])
return 1
"#;

const RELEASE_HOLDER_SCRIPT: &str = r#"
local removed = 0
local entries = redis.call('HGETALL', KEYS[1])
for i = 1, #entries, 2 do
  local e = cjson.decode(entries[i + 1])
  if e.holder_kind == 'booking' and e.holder_id == ARGV[1] then
    if e.state == 'converted' then
      redis.call('HINCRBY', KEYS[3], 'converted_claims', -1)
    end
    redis.call('HDEL', KEYS[1], entries[i])
    redis.call('ZREM', KEYS[2], ARGV[2] .. ':' .. entries[i])
    removed = removed + 1
  end
end
return removed
"#;

// Removes a hold only if it is still held and past its expiry.
const EXPIRE_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  redis.call('ZREM', KEYS[2], ARGV[2])
  return false
end
local e = cjson.decode(raw)
if e.state ~= 'held' then
  redis.call('ZREM', KEYS[2], ARGV[2])
  return false
end
if tonumber(e.expires_ms) > tonumber(ARGV[3]) then return false end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[2])
return raw
"#;

/// Stored form of a ledger entry. Times are epoch milliseconds so the Lua
/// side can compare them as numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    start_ms: i64,
    end_ms: i64,
    state: String,
    expires_ms: i64,
    holder_kind: String,
    holder_id: String,
}

impl LedgerEntry {
    fn new(slot: &TimeRange, state: &str, expires_at: DateTime<Utc>, holder: &SlotHolder) -> Self {
        let (holder_kind, holder_id) = holder_parts(holder);
        Self {
            start_ms: slot.start.timestamp_millis(),
            end_ms: slot.end.timestamp_millis(),
            state: state.to_string(),
            expires_ms: expires_at.timestamp_millis(),
            holder_kind: holder_kind.to_string(),
            holder_id: holder_id.to_string(),
        }
    }

    fn into_handle(self, id: Uuid, provider_id: Uuid) -> Result<ReservationHandle, LedgerError> {
        let holder_id = Uuid::parse_str(&self.holder_id)
            .map_err(|e| LedgerError::Storage(format!("Corrupt holder id: {}", e)))?;
        let holder = match self.holder_kind.as_str() {
            "booking" => SlotHolder::Booking(holder_id),
            _ => SlotHolder::Request(holder_id),
        };
        let start = millis(self.start_ms)?;
        let end = millis(self.end_ms)?;

        Ok(ReservationHandle {
            id,
            provider_id,
            slot: TimeRange { start, end },
            holder,
            expires_at: millis(self.expires_ms)?,
        })
    }
}

fn holder_parts(holder: &SlotHolder) -> (&'static str, Uuid) {
    match *holder {
        SlotHolder::Request(id) => ("request", id),
        SlotHolder::Booking(id) => ("booking", id),
    }
}

fn millis(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| LedgerError::Storage(format!("Invalid timestamp {}", ms)))
}

/// Ledger shared by every instance through Redis. Each mutation of a
/// provider's timeline is one Lua script, which Redis runs atomically.
pub struct RedisReservationLedger {
    pool: Pool,
    clock: Arc<dyn Clock>,
    acquire_script: Script,
    promote_script: Script,
    release_script: Script,
    release_holder_script: Script,
    expire_script: Script,
}

impl RedisReservationLedger {
    pub async fn connect(redis_url: &str, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| LedgerError::Storage(format!("Pool creation error: {}", e)))?;

        let ledger = Self::new(pool, clock);
        let mut conn = ledger.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis reservation ledger initialized");

        Ok(ledger)
    }

    pub fn new(pool: Pool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            release_holder_script: Script::new(RELEASE_HOLDER_SCRIPT),
            expire_script: Script::new(EXPIRE_SCRIPT),
        }
    }

    fn timeline_key(provider_id: Uuid) -> String {
        format!("slot_ledger:{}", provider_id)
    }

    fn hold_member(provider_id: Uuid, reservation_id: Uuid) -> String {
        format!("{}:{}", provider_id, reservation_id)
    }

    async fn connection(&self) -> Result<Connection, LedgerError> {
        self.pool
            .get()
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl ReservationLedger for RedisReservationLedger {
    async fn acquire(
        &self,
        provider_id: Uuid,
        slot: TimeRange,
        ttl: Duration,
        holder: SlotHolder,
    ) -> Result<ReservationHandle, LedgerError> {
        let mut conn = self.connection().await?;
        let now = self.clock.now();
        let id = Uuid::new_v4();
        let expires_at = now + ttl;
        let entry = LedgerEntry::new(&slot, "held", expires_at, &holder);

        let inserted: i64 = self
            .acquire_script
            .key(Self::timeline_key(provider_id))
            .key(HOLDS_KEY)
            .arg(id.to_string())
            .arg(serde_json::to_string(&entry)?)
            .arg(now.timestamp_millis())
            .arg(entry.start_ms)
            .arg(entry.end_ms)
            .arg(&entry.holder_kind)
            .arg(&entry.holder_id)
            .arg(entry.expires_ms)
            .arg(Self::hold_member(provider_id, id))
            .invoke_async(&mut conn)
            .await?;

        if inserted == 0 {
            debug!("Slot {} for provider {} conflicts with a live reservation", slot, provider_id);
            return Err(LedgerError::Conflict { provider_id });
        }

        Ok(ReservationHandle { id, provider_id, slot, holder, expires_at })
    }

    async fn release(&self, handle: &ReservationHandle, reason: ReleaseReason) -> Result<bool, LedgerError> {
        let mut conn = self.connection().await?;
        let (holder_kind, holder_id) = holder_parts(&handle.holder);

        let removed: i64 = self
            .release_script
            .key(Self::timeline_key(handle.provider_id))
            .key(HOLDS_KEY)
            .key(STATS_KEY)
            .arg(handle.id.to_string())
            .arg(Self::hold_member(handle.provider_id, handle.id))
            .arg(holder_kind)
            .arg(holder_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if removed > 0 {
            debug!("Reservation {} released ({})", handle.id, reason);
        }
        Ok(removed > 0)
    }

    async fn promote(&self, handle: &ReservationHandle, booking_id: Uuid) -> Result<ReservationHandle, LedgerError> {
        let mut conn = self.connection().await?;
        let owner = SlotHolder::Booking(booking_id);
        let converted = LedgerEntry::new(&handle.slot, "converted", handle.expires_at, &owner);
        let (holder_kind, holder_id) = holder_parts(&handle.holder);

        let outcome: i64 = self
            .promote_script
            .key(Self::timeline_key(handle.provider_id))
            .key(HOLDS_KEY)
            .key(STATS_KEY)
            .arg(handle.id.to_string())
            .arg(booking_id.to_string())
            .arg(self.clock.now().timestamp_millis())
            .arg(serde_json::to_string(&converted)?)
            .arg(Self::hold_member(handle.provider_id, handle.id))
            .arg(holder_kind)
            .arg(holder_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if outcome == 0 {
            return Err(LedgerError::ReservationLost(handle.id));
        }

        debug!("Reservation {} promoted for booking {}", handle.id, booking_id);
        Ok(ReservationHandle { holder: owner, ..*handle })
    }

    async fn release_holder(
        &self,
        provider_id: Uuid,
        booking_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<u64, LedgerError> {
        let mut conn = self.connection().await?;

        let removed: u64 = self
            .release_holder_script
            .key(Self::timeline_key(provider_id))
            .key(HOLDS_KEY)
            .key(STATS_KEY)
            .arg(booking_id.to_string())
            .arg(provider_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if removed > 0 {
            debug!("Released {} reservations of booking {} ({})", removed, booking_id, reason);
        }
        Ok(removed)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<ReservationHandle>, LedgerError> {
        let mut conn = self.connection().await?;
        let now_ms = now.timestamp_millis();

        let due: Vec<String> = conn.zrangebyscore(HOLDS_KEY, "-inf", now_ms).await?;
        let mut released = Vec::new();

        for member in due {
            let (provider, reservation) = match member.split_once(':') {
                Some(parts) => parts,
                None => continue,
            };
            let (provider_id, reservation_id) = match (Uuid::parse_str(provider), Uuid::parse_str(reservation)) {
                (Ok(p), Ok(r)) => (p, r),
                _ => {
                    let _: () = conn.zrem(HOLDS_KEY, &member).await?;
                    continue;
                }
            };

            // Another sweeper may have taken it first; that yields nil.
            let raw: Option<String> = self
                .expire_script
                .key(Self::timeline_key(provider_id))
                .key(HOLDS_KEY)
                .arg(reservation_id.to_string())
                .arg(&member)
                .arg(now_ms)
                .invoke_async(&mut conn)
                .await?;

            if let Some(raw) = raw {
                let entry: LedgerEntry = serde_json::from_str(&raw)?;
                released.push(entry.into_handle(reservation_id, provider_id)?);
            }
        }

        if !released.is_empty() {
            info!("Released {} expired reservations", released.len());
        }
        Ok(released)
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let mut conn = self.connection().await?;
        let now_ms = self.clock.now().timestamp_millis();

        let active_holds: u64 = conn.zcount(HOLDS_KEY, format!("({}", now_ms), "+inf").await?;
        let converted: Option<i64> = conn.hget(STATS_KEY, "converted_claims").await?;

        Ok(LedgerStats {
            active_holds,
            converted_claims: converted.unwrap_or(0).max(0) as u64,
        })
    }
}
