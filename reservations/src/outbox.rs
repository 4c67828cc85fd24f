//! Outbox relay: republishes `booking_outbox` rows written transactionally
//! alongside a state change (currently only expiration) onto the bus, so
//! the reconciliation worker's feed never loses a transition to a crash
//! between a durable write and a bus publish.

use std::sync::Arc;
use std::time::Duration;

use composable_rust_core::event::SerializedEvent;
use composable_rust_core::event_bus::EventBus;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{BookingEvent, BOOKING_EVENTS};
use crate::types::{BookingId, ZoneId};

/// Errors surfaced while relaying an outbox batch.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The underlying database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Polls `booking_outbox` for unrelayed rows and republishes them.
pub struct OutboxRelay {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    poll_interval: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    /// Build a relay over its durable pool and event bus handle.
    #[must_use]
    pub const fn new(
        pool: PgPool,
        bus: Arc<dyn EventBus>,
        poll_interval: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            pool,
            bus,
            poll_interval,
            batch_size: batch_size as i64,
        }
    }

    /// Run the poll-and-relay loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.relay_once().await {
                        Ok(relayed) if relayed > 0 => info!(relayed, "relayed outbox rows"),
                        Ok(_) => {}
                        Err(err) => warn!(%err, "outbox relay tick failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("outbox relay shutting down");
                    break;
                }
            }
        }
    }

    /// Relay one batch of unrelayed rows, returning the number published.
    ///
    /// A row whose publish fails is left unrelayed for the next tick — at
    /// least once, never silently dropped — while rows that do publish are
    /// marked individually so a mid-batch failure doesn't re-send rows
    /// that already went out.
    ///
    /// # Errors
    /// Returns an error if listing unrelayed rows itself fails.
    pub async fn relay_once(&self) -> Result<usize, OutboxError> {
        let rows = sqlx::query(
            "SELECT id, booking_id, event_type, payload FROM booking_outbox \
             WHERE relayed_at IS NULL ORDER BY id ASC LIMIT $1",
        )
        .bind(self.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut relayed = 0;
        for row in rows {
            let outbox_id: i64 = row.get("id");
            let event_type: String = row.get("event_type");
            let payload: serde_json::Value = row.get("payload");

            let Some(event) = decode_event(&event_type, &payload) else {
                warn!(outbox_id, event_type, "skipping outbox row with undecodable payload");
                continue;
            };

            if self.publish(outbox_id, &event).await {
                sqlx::query("UPDATE booking_outbox SET relayed_at = now() WHERE id = $1")
                    .bind(outbox_id)
                    .execute(&self.pool)
                    .await?;
                relayed += 1;
            }
        }

        Ok(relayed)
    }

    async fn publish(&self, outbox_id: i64, event: &BookingEvent) -> bool {
        let serialized = match SerializedEvent::from_event(event, None) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(%err, outbox_id, "failed to serialize outbox event");
                return false;
            }
        };
        match self.bus.publish(BOOKING_EVENTS, &serialized).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, outbox_id, "failed to publish outbox event, will retry next tick");
                false
            }
        }
    }
}

fn decode_event(event_type: &str, payload: &serde_json::Value) -> Option<BookingEvent> {
    match event_type {
        "booking.expired" => {
            let booking_id = parse_uuid_field(payload, "booking_id")?;
            // `event_id` is carried in the outbox row for operator
            // debugging but `BookingEvent::Expired` doesn't need it.
            let zone_id = parse_uuid_field(payload, "zone_id")?;
            let quantity = payload.get("quantity")?.as_u64()?;
            Some(BookingEvent::Expired {
                booking_id: BookingId(booking_id),
                zone_id: ZoneId(zone_id),
                quantity: u32::try_from(quantity).ok()?,
            })
        }
        other => {
            warn!(event_type = other, "unknown outbox event type");
            None
        }
    }
}

fn parse_uuid_field(payload: &serde_json::Value, field: &str) -> Option<Uuid> {
    let raw = payload.get(field)?.as_str()?;
    Uuid::parse_str(raw).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn decode_event_parses_a_booking_expired_row() {
        let booking_id = Uuid::new_v4();
        let event_id = Uuid::new_v4();
        let zone_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "booking_id": booking_id,
            "event_id": event_id,
            "zone_id": zone_id,
            "quantity": 3,
        });

        let event = decode_event("booking.expired", &payload).expect("decodes");
        match event {
            BookingEvent::Expired {
                booking_id: decoded_id,
                zone_id: decoded_zone,
                quantity,
            } => {
                assert_eq!(decoded_id.as_uuid(), booking_id);
                assert_eq!(decoded_zone.as_uuid(), zone_id);
                assert_eq!(quantity, 3);
            }
            other => panic!("unexpected event variant: {other:?}"),
        }
    }

    #[test]
    fn decode_event_rejects_unknown_event_types() {
        assert!(decode_event("booking.something_else", &serde_json::json!({})).is_none());
    }
}
