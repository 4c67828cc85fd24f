//! Queue Admission Controller: a Redis-backed virtual waiting room.
//!
//! Users join a per-event FIFO queue before they are allowed to call the
//! Reservation Service. A background release loop periodically admits the
//! head of the queue, minting each admitted user a signed queue-pass JWT.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::jwt::{QueuePassJwtError, QueuePassSigner};
use crate::types::{EventId, QueuePassClaims, UserId};

/// Errors surfaced by the Queue Admission Controller.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying Redis connection or command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// Signing or validating the queue-pass JWT failed.
    #[error("queue pass error: {0}")]
    Jwt(#[from] QueuePassJwtError),
    /// The caller is not currently enqueued for this event.
    #[error("user is not in the queue for this event")]
    NotQueued,
    /// The caller is not currently enqueued for this event.
    #[error("user is not in the queue for this event")]
    NotInQueue,
    /// The caller already holds a live queue entry for this event.
    #[error("user is already in the queue for this event")]
    AlreadyInQueue,
    /// The event's queue has reached its configured capacity.
    #[error("queue is full")]
    QueueFull,
    /// The token presented to `leave` does not match the caller's entry.
    #[error("token does not match the caller's queue entry")]
    InvalidToken,
}

fn zset_key(event_id: EventId) -> String {
    format!("queue:{event_id}:waiting")
}

fn member_key(user_id: UserId) -> String {
    user_id.to_string()
}

fn revoked_jti_key(jti: &str) -> String {
    format!("queue:revoked_jti:{jti}")
}

fn issued_pass_key(event_id: EventId, user_id: UserId) -> String {
    format!("queue:{event_id}:pass:{user_id}")
}

fn entry_key(event_id: EventId, user_id: UserId) -> String {
    format!("queue:{event_id}:entry:{user_id}")
}

/// Outcome of a successful [`QueueAdmissionController::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub position: u64,
    pub token: String,
    pub estimated_wait_seconds: u64,
    pub joined_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a [`QueueAdmissionController::get_position`] lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionOutcome {
    pub position: u64,
    pub total_in_queue: u64,
    pub estimated_wait_seconds: u64,
    pub is_ready: bool,
    pub queue_pass: Option<String>,
    pub queue_pass_expires_at: Option<DateTime<Utc>>,
}

/// Redis-backed virtual queue and queue-pass issuer.
#[derive(Clone)]
pub struct QueueAdmissionController {
    conn: ConnectionManager,
    signer: QueuePassSigner,
    entry_ttl: Duration,
    pass_ttl: Duration,
    max_queue_length: Option<u64>,
    per_user_wait_seconds: u64,
}

impl QueueAdmissionController {
    /// Build a controller over an existing connection manager and signer.
    #[must_use]
    pub const fn new(
        conn: ConnectionManager,
        signer: QueuePassSigner,
        entry_ttl: Duration,
        pass_ttl: Duration,
        max_queue_length: Option<u64>,
        per_user_wait_seconds: u64,
    ) -> Self {
        Self {
            conn,
            signer,
            entry_ttl,
            pass_ttl,
            max_queue_length,
            per_user_wait_seconds,
        }
    }

    /// Join the waiting room for an event.
    ///
    /// # Errors
    /// Returns [`QueueError::AlreadyInQueue`] if the caller already holds a
    /// live entry, [`QueueError::QueueFull`] if the event's queue is at
    /// capacity, or a Redis failure.
    pub async fn join(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<JoinOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let key = zset_key(event_id);
        let member = member_key(user_id);

        if let Some(max) = self.max_queue_length {
            let len: u64 = conn.zcard(&key).await?;
            if len >= max {
                return Err(QueueError::QueueFull);
            }
        }

        let score = Utc::now().timestamp_millis() as f64;
        let added: bool = conn.zadd_nx(&key, &member, score).await?;
        if !added {
            return Err(QueueError::AlreadyInQueue);
        }
        let _: () = conn.expire(&key, self.entry_ttl.as_secs() as i64).await?;

        let token = Self::mint_entry_token();
        let joined_at = Utc::now();
        let expires_at = joined_at + chrono::Duration::seconds(self.entry_ttl.as_secs() as i64);
        let entry = entry_key(event_id, user_id);
        let _: () = conn
            .hset_multiple(
                &entry,
                &[
                    ("token", token.clone()),
                    ("joined_at", joined_at.to_rfc3339()),
                    ("expires_at", expires_at.to_rfc3339()),
                ],
            )
            .await?;
        let _: () = conn.expire(&entry, self.entry_ttl.as_secs() as i64).await?;

        let position = self.position(event_id, user_id).await?;
        Ok(JoinOutcome {
            position,
            token,
            estimated_wait_seconds: position * self.per_user_wait_seconds,
            joined_at,
            expires_at,
        })
    }

    /// Current 1-based queue position, or 0 if not queued / already admitted.
    ///
    /// # Errors
    /// Returns an error on a Redis failure.
    pub async fn position(&self, event_id: EventId, user_id: UserId) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let key = zset_key(event_id);
        let rank: Option<u64> = conn.zrank(&key, member_key(user_id)).await?;
        Ok(rank.map_or(0, |r| r + 1))
    }

    /// Full position lookup: reports a pending pass if one was already
    /// released, otherwise the caller's rank, opportunistically issuing a
    /// pass if they have reached the head of the queue.
    ///
    /// # Errors
    /// Returns [`QueueError::NotInQueue`] if the caller holds neither a
    /// live queue entry nor a pending pass, or a Redis failure.
    pub async fn get_position(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<PositionOutcome, QueueError> {
        if let Some(token) = self.take_issued_pass(event_id, user_id).await? {
            let expires_at = self
                .signer
                .validate(&token)
                .ok()
                .and_then(|claims| DateTime::from_timestamp(claims.exp, 0));
            return Ok(PositionOutcome {
                position: 0,
                total_in_queue: self.total(event_id).await?,
                estimated_wait_seconds: 0,
                is_ready: true,
                queue_pass: Some(token),
                queue_pass_expires_at: expires_at,
            });
        }

        let position = self.position(event_id, user_id).await?;
        if position == 0 {
            return Err(QueueError::NotInQueue);
        }

        if position == 1 {
            match self.release_batch(event_id, 1).await {
                Ok(issued) if !issued.is_empty() => {
                    let (_, token) = &issued[0];
                    let expires_at = self
                        .signer
                        .validate(token)
                        .ok()
                        .and_then(|claims| DateTime::from_timestamp(claims.exp, 0));
                    return Ok(PositionOutcome {
                        position: 0,
                        total_in_queue: self.total(event_id).await?,
                        estimated_wait_seconds: 0,
                        is_ready: true,
                        queue_pass: Some(token.clone()),
                        queue_pass_expires_at: expires_at,
                    });
                }
                Ok(_) => {}
                Err(err) => warn!(%err, %event_id, %user_id, "best-effort pass issuance on position read failed"),
            }
        }

        Ok(PositionOutcome {
            position,
            total_in_queue: self.total(event_id).await?,
            estimated_wait_seconds: position * self.per_user_wait_seconds,
            is_ready: false,
            queue_pass: None,
            queue_pass_expires_at: None,
        })
    }

    async fn total(&self, event_id: EventId) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(zset_key(event_id)).await?)
    }

    /// Leave the queue voluntarily. The presented token must match the one
    /// issued at `join` time.
    ///
    /// # Errors
    /// Returns [`QueueError::InvalidToken`] if the caller holds no entry or
    /// the token doesn't match, or a Redis failure.
    pub async fn leave(
        &self,
        event_id: EventId,
        user_id: UserId,
        token: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let entry = entry_key(event_id, user_id);
        let stored: Option<String> = conn.hget(&entry, "token").await?;
        match stored {
            Some(stored_token) if stored_token == token => {
                let _: u64 = conn.zrem(zset_key(event_id), member_key(user_id)).await?;
                let _: () = conn.del(&entry).await?;
                Ok(())
            }
            _ => Err(QueueError::InvalidToken),
        }
    }

    /// Admit the lowest-scored `batch_size` users still waiting, minting
    /// each a signed queue pass and stashing it for pickup by
    /// [`Self::take_issued_pass`]. Returns the passes issued this tick.
    ///
    /// # Errors
    /// Returns an error on a Redis failure or signing failure.
    pub async fn release_batch(
        &self,
        event_id: EventId,
        batch_size: u64,
    ) -> Result<Vec<(UserId, String)>, QueueError> {
        let mut conn = self.conn.clone();
        let key = zset_key(event_id);

        let members: Vec<String> = conn.zrange(&key, 0, (batch_size as isize) - 1).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let mut issued = Vec::with_capacity(members.len());
        for raw in &members {
            let Ok(uuid) = raw.parse() else {
                warn!(member = %raw, "dropping unparseable queue member");
                continue;
            };
            let user_id = UserId(uuid);
            let token = self.signer.sign(user_id, event_id)?;
            let _: () = conn
                .set_ex(issued_pass_key(event_id, user_id), &token, self.pass_ttl.as_secs())
                .await?;
            let _: () = conn.del(entry_key(event_id, user_id)).await?;
            issued.push((user_id, token));
        }

        let _: u64 = conn.zrem(&key, &members).await?;
        debug!(count = issued.len(), %event_id, "released batch from queue");
        Ok(issued)
    }

    /// Pick up (and consume) a pass issued to this user by a previous
    /// [`Self::release_batch`] tick, if one is still pending pickup.
    ///
    /// # Errors
    /// Returns an error on a Redis failure.
    pub async fn take_issued_pass(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let token: Option<String> = conn.get_del(issued_pass_key(event_id, user_id)).await?;
        Ok(token)
    }

    /// Validate a presented queue pass, rejecting one that has already been
    /// redeemed (single-use via a revocation marker on the `jti`).
    ///
    /// # Errors
    /// Returns an error if the token is invalid, expired, or already used.
    pub async fn redeem(&self, token: &str) -> Result<QueuePassClaims, QueueError> {
        let claims = self.signer.validate(token)?;

        let mut conn = self.conn.clone();
        let key = revoked_jti_key(&claims.jti);
        let first_use: bool = conn
            .set_nx(&key, true)
            .await
            .map_err(QueueError::Redis)?;
        if first_use {
            let _: () = conn
                .expire(&key, self.pass_ttl.as_secs() as i64 + 60)
                .await?;
        } else {
            return Err(QueueError::NotQueued);
        }

        Ok(claims)
    }

    /// Mint a random opaque per-entry token that the caller must present
    /// back to [`Self::leave`] to prove ownership of a queue slot.
    #[must_use]
    pub fn mint_entry_token() -> String {
        let mut bytes = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Run the periodic release loop until `shutdown` fires.
    pub async fn run_release_loop(
        &self,
        event_id: EventId,
        interval: Duration,
        batch_size: u64,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.release_batch(event_id, batch_size).await {
                        Ok(issued) if !issued.is_empty() => {
                            info!(count = issued.len(), %event_id, "admitted users from queue");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, %event_id, "queue release tick failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!(%event_id, "queue release loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn entry_token_is_32_hex_chars() {
        let token = QueueAdmissionController::mint_entry_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn test_controller(conn: ConnectionManager) -> QueueAdmissionController {
        let signer = QueuePassSigner::new("secret", "booking-service", 120);
        QueueAdmissionController::new(
            conn,
            signer,
            Duration::from_secs(60),
            Duration::from_secs(60),
            None,
            3,
        )
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn join_then_position_reports_rank() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let controller = test_controller(conn);

        let event_id = EventId::new();
        let user_a = UserId::new();
        let user_b = UserId::new();

        let outcome_a = controller.join(event_id, user_a).await.unwrap();
        let outcome_b = controller.join(event_id, user_b).await.unwrap();

        assert_eq!(outcome_a.position, 1);
        assert_eq!(outcome_b.position, 2);
        assert_eq!(controller.position(event_id, user_a).await.unwrap(), 1);
        assert_eq!(controller.position(event_id, user_b).await.unwrap(), 2);
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn rejoining_an_already_queued_user_is_rejected() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let controller = test_controller(conn);

        let event_id = EventId::new();
        let user_id = UserId::new();
        controller.join(event_id, user_id).await.unwrap();

        let second = controller.join(event_id, user_id).await;
        assert!(matches!(second, Err(QueueError::AlreadyInQueue)));
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn joining_a_full_queue_is_rejected() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let signer = QueuePassSigner::new("secret", "booking-service", 120);
        let controller = QueueAdmissionController::new(
            conn,
            signer,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Some(1),
            3,
        );

        let event_id = EventId::new();
        controller.join(event_id, UserId::new()).await.unwrap();

        let rejected = controller.join(event_id, UserId::new()).await;
        assert!(matches!(rejected, Err(QueueError::QueueFull)));
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn leave_with_wrong_token_is_rejected() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let controller = test_controller(conn);

        let event_id = EventId::new();
        let user_id = UserId::new();
        controller.join(event_id, user_id).await.unwrap();

        let result = controller.leave(event_id, user_id, "not-the-real-token").await;
        assert!(matches!(result, Err(QueueError::InvalidToken)));
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn leave_with_correct_token_removes_entry() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let controller = test_controller(conn);

        let event_id = EventId::new();
        let user_id = UserId::new();
        let outcome = controller.join(event_id, user_id).await.unwrap();

        controller.leave(event_id, user_id, &outcome.token).await.unwrap();
        assert_eq!(controller.position(event_id, user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn released_pass_is_redeemable_once_and_once_only() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let controller = test_controller(conn);

        let event_id = EventId::new();
        let user_id = UserId::new();
        controller.join(event_id, user_id).await.unwrap();

        let issued = controller.release_batch(event_id, 10).await.unwrap();
        assert_eq!(issued.len(), 1);
        let (released_user, token) = &issued[0];
        assert_eq!(*released_user, user_id);

        let picked_up = controller.take_issued_pass(event_id, user_id).await.unwrap();
        assert_eq!(picked_up.as_deref(), Some(token.as_str()));

        let claims = controller.redeem(token).await.unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.event_id, event_id);

        let replay = controller.redeem(token).await;
        assert!(matches!(replay, Err(QueueError::NotQueued)));
    }

    #[tokio::test]
    #[ignore = "requires a live Redis instance"]
    async fn get_position_at_head_issues_a_pass() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let controller = test_controller(conn);

        let event_id = EventId::new();
        let user_id = UserId::new();
        controller.join(event_id, user_id).await.unwrap();

        let outcome = controller.get_position(event_id, user_id).await.unwrap();
        assert!(outcome.is_ready);
        assert!(outcome.queue_pass.is_some());
        assert_eq!(outcome.position, 0);
    }
}
