//! Atomic Inventory Store: Redis-backed zone counters plus a per-booking
//! reservation record.
//!
//! Every mutation (`reserve`, `confirm`, `release`) is a single
//! [`redis::Script`] invocation so that the read-modify-write is atomic
//! under concurrent callers, without a client-side lock. `reserve` also
//! writes a reservation record under a freshly generated booking id, with
//! its own TTL padded past the nominal reservation TTL by
//! [`RESERVATION_GRACE_SECS`] — the grace window lets `confirm`/`release`
//! distinguish "already passively expired" from "never existed" for a
//! little while after the nominal deadline, instead of collapsing both into
//! the same missing-key case immediately.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use thiserror::Error;

use crate::types::{BookingId, EventId, PaymentId, ShowId, UserId, ZoneId};

/// How far past a reservation's nominal TTL its Redis record is kept around
/// (in a logically-expired-but-still-readable state) before physical TTL
/// expiry reclaims the key outright.
const RESERVATION_GRACE_SECS: u64 = 300;

/// Errors surfaced by the Atomic Inventory Store.
#[derive(Debug, Error)]
pub enum AisError {
    /// The underlying Redis connection or command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// The zone has fewer available tickets than requested.
    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory {
        /// Tickets requested.
        requested: u32,
        /// Tickets actually available.
        available: u32,
    },
    /// Admitting this reservation would push the user over their per-event cap.
    #[error("user ticket cap exceeded: {current} + {requested} > {cap}")]
    UserLimitExceeded {
        /// Tickets the user currently holds for this event, per the AIS counter.
        current: u32,
        /// Tickets requested in this call.
        requested: u32,
        /// Configured cap.
        cap: u32,
    },
    /// The zone has not been initialized with a capacity.
    #[error("zone {0} has no known capacity")]
    UnknownZone(ZoneId),
    /// Requested quantity was not in `1..=max_per_user`.
    #[error("quantity must be greater than zero")]
    InvalidQuantity,
    /// No reservation record exists for this booking id.
    #[error("reservation {0} not found")]
    ReservationNotFound(BookingId),
    /// The reservation belongs to a different user.
    #[error("reservation does not belong to this user")]
    InvalidUser,
    /// The reservation is already confirmed under a different payment id.
    #[error("reservation already confirmed")]
    AlreadyConfirmed,
    /// The reservation's TTL has logically elapsed (still within the grace
    /// window, so the store can tell rather than treating it as never found).
    #[error("reservation has expired")]
    ReservationExpired,
    /// The reservation was already released.
    #[error("reservation already released")]
    AlreadyReleased,
}

/// Key for a zone's available-ticket counter.
fn available_key(show_id: ShowId, zone_id: ZoneId) -> String {
    format!("inv:{{{show_id}}}:{zone_id}:available")
}

/// Key for a zone's total capacity, used to detect an uninitialized zone.
fn capacity_key(show_id: ShowId, zone_id: ZoneId) -> String {
    format!("inv:{{{show_id}}}:{zone_id}:capacity")
}

/// Key for a user's live-ticket counter within one event, enforcing the
/// per-user cap atomically alongside the zone debit.
fn user_count_key(event_id: EventId, user_id: UserId) -> String {
    format!("inv:user:{{{event_id}}}:{user_id}")
}

/// Key for one booking's reservation record: the hash `confirm`/`release`
/// look up by booking id alone, carrying enough context (show, zone, event,
/// user, quantity) to locate and mutate the counters above without the
/// caller having to supply them again.
fn reservation_key(booking_id: BookingId) -> String {
    format!("inv:reservation:{{{booking_id}}}")
}

/// Atomically reserves `quantity` tickets from a zone, admits them against
/// the caller's per-event cap, and writes a reservation record — all as a
/// single step, so neither check can be stale by the time the counters are
/// mutated and no reservation can be "half written".
const RESERVE_SCRIPT: &str = r"
local available_key = KEYS[1]
local capacity_key = KEYS[2]
local user_count_key = KEYS[3]
local reservation_key = KEYS[4]
local quantity = tonumber(ARGV[1])
local max_per_user = tonumber(ARGV[2])
local user_ttl = tonumber(ARGV[3])
local reservation_ttl = tonumber(ARGV[4])
local show_id = ARGV[6]
local zone_id = ARGV[7]
local event_id = ARGV[8]
local user_id = ARGV[9]
local expires_at = ARGV[10]

if quantity <= 0 then
    return {-4, 0, 0}
end

local capacity = redis.call('GET', capacity_key)
if not capacity then
    return {-2, 0, 0}
end

local user_count = tonumber(redis.call('GET', user_count_key) or '0')
if user_count + quantity > max_per_user then
    return {-3, user_count, max_per_user}
end

local available = tonumber(redis.call('GET', available_key) or capacity)
if available < quantity then
    return {-1, available, 0}
end

redis.call('DECRBY', available_key, quantity)
redis.call('INCRBY', user_count_key, quantity)
redis.call('EXPIRE', user_count_key, user_ttl)

redis.call('HSET', reservation_key,
    'show_id', show_id,
    'zone_id', zone_id,
    'event_id', event_id,
    'user_id', user_id,
    'quantity', quantity,
    'status', 'reserved',
    'expires_at', expires_at)
redis.call('EXPIRE', reservation_key, reservation_ttl)

return {1, available - quantity, user_count + quantity}
";

/// Confirms a reservation by booking id: checks ownership and logical
/// expiry, then marks the record permanent (no further TTL) and attaches
/// the payment id. Re-confirming with the same payment id is a no-op
/// success; a different payment id is rejected as already confirmed.
const CONFIRM_SCRIPT: &str = r"
local reservation_key = KEYS[1]
local user_id = ARGV[1]
local payment_id = ARGV[2]
local now = tonumber(ARGV[3])

if redis.call('EXISTS', reservation_key) == 0 then
    return -1
end

if redis.call('HGET', reservation_key, 'user_id') ~= user_id then
    return -2
end

local expires_at = tonumber(redis.call('HGET', reservation_key, 'expires_at') or '0')
if expires_at > 0 and now >= expires_at then
    return -4
end

if redis.call('HGET', reservation_key, 'status') == 'confirmed' then
    if redis.call('HGET', reservation_key, 'payment_id') == payment_id then
        return 1
    end
    return -3
end

redis.call('HSET', reservation_key, 'status', 'confirmed', 'payment_id', payment_id)
redis.call('PERSIST', reservation_key)
return 1
";

/// Releases a reservation by booking id: checks ownership, credits
/// `quantity` back to the zone (capped at capacity), debits the user's
/// per-event counter, and tombstones the record so a fast retry is
/// idempotent. The zone/user keys are rebuilt from fields stored on the
/// reservation record rather than passed in, so this assumes a single-node
/// Redis (or cluster routing by the reservation key's own hash tag) — the
/// same non-cluster assumption the rest of this store already makes.
const RELEASE_SCRIPT: &str = r"
local reservation_key = KEYS[1]
local user_id = ARGV[1]

if redis.call('EXISTS', reservation_key) == 0 then
    return {-1, 0}
end

if redis.call('HGET', reservation_key, 'user_id') ~= user_id then
    return {-2, 0}
end

if redis.call('HGET', reservation_key, 'status') == 'released' then
    local show_id = redis.call('HGET', reservation_key, 'show_id')
    local zone_id = redis.call('HGET', reservation_key, 'zone_id')
    local available = tonumber(redis.call('GET', 'inv:{' .. show_id .. '}:' .. zone_id .. ':available') or '0')
    return {-3, available}
end

local show_id = redis.call('HGET', reservation_key, 'show_id')
local zone_id = redis.call('HGET', reservation_key, 'zone_id')
local event_id = redis.call('HGET', reservation_key, 'event_id')
local quantity = tonumber(redis.call('HGET', reservation_key, 'quantity') or '0')

local available_key = 'inv:{' .. show_id .. '}:' .. zone_id .. ':available'
local capacity_key = 'inv:{' .. show_id .. '}:' .. zone_id .. ':capacity'
local user_count_key = 'inv:user:{' .. event_id .. '}:' .. user_id

local capacity = tonumber(redis.call('GET', capacity_key) or '0')
local available = tonumber(redis.call('GET', available_key) or capacity)
local restored = math.min(available + quantity, capacity)
redis.call('SET', available_key, restored)

local user_count = tonumber(redis.call('GET', user_count_key) or '0')
local remaining_for_user = math.max(user_count - quantity, 0)
if remaining_for_user == 0 then
    redis.call('DEL', user_count_key)
else
    redis.call('SET', user_count_key, remaining_for_user)
end

redis.call('HSET', reservation_key, 'status', 'released')
redis.call('EXPIRE', reservation_key, 60)

return {1, restored}
";

/// Outcome of a successful [`AtomicInventoryStore::reserve`] call.
#[derive(Debug, Clone, Copy)]
pub struct ReserveOutcome {
    /// Freshly generated id for the reservation record this call wrote.
    pub booking_id: BookingId,
    /// Tickets remaining in the zone after this reservation.
    pub available: u32,
    /// The caller's total live tickets for this event after this reservation.
    pub user_reserved: u32,
}

/// Atomic counters over Redis for per-zone ticket availability, plus the
/// per-booking reservation records `confirm`/`release` act on.
#[derive(Clone)]
pub struct AtomicInventoryStore {
    conn: ConnectionManager,
}

impl AtomicInventoryStore {
    /// Build a store over an existing connection manager.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect using a Redis URL.
    ///
    /// # Errors
    /// Returns an error if the client cannot be constructed or the initial
    /// connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, AisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }

    /// Initialize (or reset) a zone's total capacity and available count.
    ///
    /// # Errors
    /// Returns an error on a Redis failure.
    pub async fn set_capacity(
        &self,
        show_id: ShowId,
        zone_id: ZoneId,
        capacity: u32,
    ) -> Result<(), AisError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(capacity_key(show_id, zone_id), capacity)
            .set(available_key(show_id, zone_id), capacity)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Reserve `quantity` tickets from a zone, atomically checked and
    /// debited together with the caller's per-event cap (`max_per_user`),
    /// and write a reservation record under a freshly generated booking id
    /// with `reservation_ttl` (padded by a grace window internally).
    ///
    /// # Errors
    /// Returns [`AisError::InvalidQuantity`] if `quantity` is zero,
    /// [`AisError::InsufficientInventory`] if not enough seats remain,
    /// [`AisError::UserLimitExceeded`] if the cap would be exceeded,
    /// [`AisError::UnknownZone`] if the zone was never initialized, or a
    /// Redis failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn reserve(
        &self,
        show_id: ShowId,
        zone_id: ZoneId,
        event_id: EventId,
        user_id: UserId,
        quantity: u32,
        max_per_user: u32,
        user_count_ttl: Duration,
        reservation_ttl: Duration,
    ) -> Result<ReserveOutcome, AisError> {
        let booking_id = BookingId::new();
        let expires_at = Utc::now() + reservation_ttl;
        let grace_padded_ttl = reservation_ttl.as_secs() + RESERVATION_GRACE_SECS;

        let mut conn = self.conn.clone();
        let (status, value, extra): (i64, u32, u32) = Script::new(RESERVE_SCRIPT)
            .key(available_key(show_id, zone_id))
            .key(capacity_key(show_id, zone_id))
            .key(user_count_key(event_id, user_id))
            .key(reservation_key(booking_id))
            .arg(quantity)
            .arg(max_per_user)
            .arg(user_count_ttl.as_secs())
            .arg(grace_padded_ttl)
            .arg(booking_id.to_string())
            .arg(show_id.to_string())
            .arg(zone_id.to_string())
            .arg(event_id.to_string())
            .arg(user_id.to_string())
            .arg(expires_at.timestamp())
            .invoke_async(&mut conn)
            .await?;

        match status {
            1 => Ok(ReserveOutcome {
                booking_id,
                available: value,
                user_reserved: extra,
            }),
            -1 => Err(AisError::InsufficientInventory {
                requested: quantity,
                available: value,
            }),
            -3 => Err(AisError::UserLimitExceeded {
                current: value,
                requested: quantity,
                cap: extra,
            }),
            -4 => Err(AisError::InvalidQuantity),
            _ => Err(AisError::UnknownZone(zone_id)),
        }
    }

    /// Confirm a reservation: removes its TTL, attaches `payment_id`, and
    /// records permanence. Idempotent when retried with the same
    /// `payment_id`; rejected as [`AisError::AlreadyConfirmed`] if retried
    /// with a different one.
    ///
    /// # Errors
    /// Returns [`AisError::ReservationNotFound`] if no record exists for
    /// `booking_id`, [`AisError::InvalidUser`] if it belongs to a different
    /// user, [`AisError::ReservationExpired`] if its TTL logically elapsed,
    /// [`AisError::AlreadyConfirmed`] on a conflicting re-confirm, or a
    /// Redis failure.
    pub async fn confirm(
        &self,
        booking_id: BookingId,
        user_id: UserId,
        payment_id: PaymentId,
    ) -> Result<(), AisError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();
        let status: i64 = Script::new(CONFIRM_SCRIPT)
            .key(reservation_key(booking_id))
            .arg(user_id.to_string())
            .arg(payment_id.to_string())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        match status {
            1 => Ok(()),
            -2 => Err(AisError::InvalidUser),
            -3 => Err(AisError::AlreadyConfirmed),
            -4 => Err(AisError::ReservationExpired),
            _ => Err(AisError::ReservationNotFound(booking_id)),
        }
    }

    /// Release a reservation: credits `quantity` back to its zone (capped
    /// at capacity), debits the user's per-event counter, and tombstones
    /// the record. Idempotent for a fast retry of the same release; a
    /// retry against an already-tombstoned record is reported as
    /// [`AisError::AlreadyReleased`] but carries no further mutation, so
    /// callers that tolerate it (as every caller in this crate does) see no
    /// double-credit.
    ///
    /// # Errors
    /// Returns [`AisError::ReservationNotFound`] if no record exists (it may
    /// already have passively expired — the Expiration Worker owns
    /// restoring availability for that case), [`AisError::InvalidUser`] if
    /// it belongs to a different user, [`AisError::AlreadyReleased`] on a
    /// repeat release, or a Redis failure.
    pub async fn release(&self, booking_id: BookingId, user_id: UserId) -> Result<u32, AisError> {
        let mut conn = self.conn.clone();
        let (status, available): (i64, u32) = Script::new(RELEASE_SCRIPT)
            .key(reservation_key(booking_id))
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match status {
            1 => Ok(available),
            -2 => Err(AisError::InvalidUser),
            -3 => Err(AisError::AlreadyReleased),
            _ => Err(AisError::ReservationNotFound(booking_id)),
        }
    }

    /// Current available count for a zone, for diagnostics and reconciliation.
    ///
    /// # Errors
    /// Returns an error on a Redis failure.
    pub async fn available(&self, show_id: ShowId, zone_id: ZoneId) -> Result<u32, AisError> {
        let mut conn = self.conn.clone();
        let value: Option<u32> = conn.get(available_key(show_id, zone_id)).await?;
        Ok(value.unwrap_or(0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn show() -> ShowId {
        ShowId::new()
    }

    fn zone() -> ZoneId {
        ZoneId::new()
    }

    fn event() -> EventId {
        EventId::new()
    }

    fn user() -> UserId {
        UserId::new()
    }

    #[test]
    fn keys_are_namespaced_per_show_and_zone() {
        let s = show();
        let z = zone();
        assert!(available_key(s, z).starts_with("inv:"));
        assert_ne!(available_key(s, z), capacity_key(s, z));
    }

    #[test]
    fn user_count_key_is_scoped_per_event_and_user() {
        let e = event();
        let u1 = user();
        let u2 = user();
        assert_ne!(user_count_key(e, u1), user_count_key(e, u2));
    }

    #[test]
    fn reservation_key_is_scoped_per_booking() {
        let b1 = BookingId::new();
        let b2 = BookingId::new();
        assert_ne!(reservation_key(b1), reservation_key(b2));
        assert!(reservation_key(b1).starts_with("inv:reservation:"));
    }

    // Exercises the real Lua against a live Redis instance. Requires
    // `REDIS_URL` (or defaults to localhost) and is skipped otherwise.
    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn reserve_then_release_round_trips_availability() {
        let store = AtomicInventoryStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("connect to redis");
        let show_id = show();
        let zone_id = zone();
        let event_id = event();
        let user_id = user();

        store.set_capacity(show_id, zone_id, 10).await.unwrap();
        let outcome = store
            .reserve(
                show_id,
                zone_id,
                event_id,
                user_id,
                4,
                10,
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        assert_eq!(outcome.available, 6);

        let restored = store.release(outcome.booking_id, user_id).await.unwrap();
        assert_eq!(restored, 10);
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn reserve_beyond_capacity_is_rejected() {
        let store = AtomicInventoryStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("connect to redis");
        let show_id = show();
        let zone_id = zone();
        let event_id = event();
        let user_id = user();

        store.set_capacity(show_id, zone_id, 2).await.unwrap();
        let err = store
            .reserve(
                show_id,
                zone_id,
                event_id,
                user_id,
                3,
                10,
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AisError::InsufficientInventory { .. }));
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn reserve_beyond_user_cap_is_rejected_before_touching_availability() {
        let store = AtomicInventoryStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("connect to redis");
        let show_id = show();
        let zone_id = zone();
        let event_id = event();
        let user_id = user();

        store.set_capacity(show_id, zone_id, 100).await.unwrap();
        store
            .reserve(
                show_id,
                zone_id,
                event_id,
                user_id,
                8,
                10,
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let err = store
            .reserve(
                show_id,
                zone_id,
                event_id,
                user_id,
                3,
                10,
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AisError::UserLimitExceeded { current: 8, requested: 3, cap: 10 }
        ));

        let available = store.available(show_id, zone_id).await.unwrap();
        assert_eq!(available, 92, "rejected-by-cap reserve must not touch availability");
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn confirm_with_a_different_payment_id_is_rejected() {
        let store = AtomicInventoryStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("connect to redis");
        let show_id = show();
        let zone_id = zone();
        let event_id = event();
        let user_id = user();

        store.set_capacity(show_id, zone_id, 10).await.unwrap();
        let outcome = store
            .reserve(
                show_id,
                zone_id,
                event_id,
                user_id,
                2,
                10,
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let first = PaymentId::new();
        store.confirm(outcome.booking_id, user_id, first).await.unwrap();
        store.confirm(outcome.booking_id, user_id, first).await.unwrap();

        let err = store
            .confirm(outcome.booking_id, user_id, PaymentId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AisError::AlreadyConfirmed));
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn confirm_by_a_different_user_is_rejected() {
        let store = AtomicInventoryStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("connect to redis");
        let show_id = show();
        let zone_id = zone();
        let event_id = event();
        let user_id = user();

        store.set_capacity(show_id, zone_id, 10).await.unwrap();
        let outcome = store
            .reserve(
                show_id,
                zone_id,
                event_id,
                user_id,
                2,
                10,
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let err = store
            .confirm(outcome.booking_id, user(), PaymentId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AisError::InvalidUser));
    }
}
