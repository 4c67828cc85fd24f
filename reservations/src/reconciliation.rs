//! Inventory Reconciliation Worker: batches booking events into periodic
//! durable counter updates so `seat_zones` eventually agrees with the
//! Atomic Inventory Store, which remains authoritative for admission.

use std::collections::HashMap;
use std::time::Duration;

use composable_rust_core::event::Event as _;
use composable_rust_core::event_bus::EventBus;
use futures::StreamExt;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::bus::{BookingEvent, BOOKING_EVENTS};
use crate::types::ZoneId;

/// Errors surfaced while flushing a reconciliation batch.
#[derive(Debug, Error)]
pub enum ReconciliationError {
    /// The durable transaction applying a batch failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Accumulated per-zone counter deltas within one tumbling window.
#[derive(Debug, Clone, Copy, Default)]
struct ZoneDelta {
    reserved: i64,
    confirmed: i64,
    cancelled: i64,
}

/// Consumes `booking.events` and periodically folds the deltas into
/// `seat_zones`, in a single transaction per flush.
pub struct ReconciliationWorker {
    pool: PgPool,
    event_bus: std::sync::Arc<dyn EventBus>,
    batch_interval: Duration,
    max_batch_size: usize,
}

impl ReconciliationWorker {
    /// Build a worker over its durable pool and event bus handle.
    #[must_use]
    pub const fn new(
        pool: PgPool,
        event_bus: std::sync::Arc<dyn EventBus>,
        batch_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        Self {
            pool,
            event_bus,
            batch_interval,
            max_batch_size,
        }
    }

    /// Run the subscribe-aggregate-flush loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let topics = [BOOKING_EVENTS];
        let mut stream = match self.event_bus.subscribe(&topics).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, "reconciliation worker failed to subscribe to booking events");
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.batch_interval);
        let mut batch: HashMap<ZoneId, ZoneDelta> = HashMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    batch = self.flush(batch).await;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(serialized)) => {
                            if let Some((zone_id, delta)) = decode_delta(&serialized.data) {
                                apply_delta(&mut batch, zone_id, delta);
                                if batch.len() >= self.max_batch_size {
                                    batch = self.flush(batch).await;
                                }
                            }
                        }
                        Some(Err(err)) => warn!(%err, "booking event stream error"),
                        None => {
                            warn!("booking event stream ended, reconnecting");
                            match self.event_bus.subscribe(&topics).await {
                                Ok(new_stream) => stream = new_stream,
                                Err(err) => {
                                    error!(%err, "failed to resubscribe to booking events");
                                    return;
                                }
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let _ = self.flush(batch).await;
                    break;
                }
            }
        }
    }

    /// Apply one batch's deltas in a single transaction. On failure the
    /// batch is handed back unchanged so the caller can merge it with the
    /// next window rather than losing the events it represents.
    async fn flush(&self, batch: HashMap<ZoneId, ZoneDelta>) -> HashMap<ZoneId, ZoneDelta> {
        if batch.is_empty() {
            return batch;
        }

        match self.apply_batch(&batch).await {
            Ok(()) => {
                info!(zones = batch.len(), "reconciled seat zone counters");
                HashMap::new()
            }
            Err(err) => {
                error!(%err, zones = batch.len(), "failed to flush reconciliation batch, retrying next tick");
                batch
            }
        }
    }

    async fn apply_batch(
        &self,
        batch: &HashMap<ZoneId, ZoneDelta>,
    ) -> Result<(), ReconciliationError> {
        let mut tx = self.pool.begin().await?;

        for (zone_id, delta) in batch {
            let available_delta = delta.cancelled - delta.reserved;
            let reserved_delta = delta.reserved - delta.confirmed - delta.cancelled;
            sqlx::query(
                "UPDATE seat_zones
                 SET available_seats = available_seats + $1,
                     reserved_seats = reserved_seats + $2,
                     sold_seats = sold_seats + $3
                 WHERE id = $4",
            )
            .bind(available_delta)
            .bind(reserved_delta)
            .bind(delta.confirmed)
            .bind(zone_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn apply_delta(batch: &mut HashMap<ZoneId, ZoneDelta>, zone_id: ZoneId, delta: ZoneDelta) {
    let entry = batch.entry(zone_id).or_default();
    entry.reserved += delta.reserved;
    entry.confirmed += delta.confirmed;
    entry.cancelled += delta.cancelled;
}

fn decode_delta(bytes: &[u8]) -> Option<(ZoneId, ZoneDelta)> {
    let event = match BookingEvent::from_bytes(bytes) {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "failed to decode booking event for reconciliation");
            return None;
        }
    };

    match event {
        BookingEvent::Created {
            zone_id, quantity, ..
        } => Some((
            zone_id,
            ZoneDelta {
                reserved: i64::from(quantity),
                ..ZoneDelta::default()
            },
        )),
        BookingEvent::Confirmed {
            zone_id, quantity, ..
        } => Some((
            zone_id,
            ZoneDelta {
                confirmed: i64::from(quantity),
                ..ZoneDelta::default()
            },
        )),
        BookingEvent::Cancelled {
            zone_id, quantity, ..
        }
        | BookingEvent::Expired {
            zone_id, quantity, ..
        } => Some((
            zone_id,
            ZoneDelta {
                cancelled: i64::from(quantity),
                ..ZoneDelta::default()
            },
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn created_event_contributes_to_reserved_delta() {
        let zone_id = ZoneId::new();
        let event = BookingEvent::Created {
            booking_id: crate::types::BookingId::new(),
            user_id: crate::types::UserId::new(),
            event_id: crate::types::EventId::new(),
            zone_id,
            quantity: 3,
        };
        let bytes = event.to_bytes().expect("serialize");
        let (decoded_zone, delta) = decode_delta(&bytes).expect("decode");
        assert_eq!(decoded_zone, zone_id);
        assert_eq!(delta.reserved, 3);
        assert_eq!(delta.confirmed, 0);
    }

    #[test]
    fn deltas_accumulate_across_multiple_events_for_the_same_zone() {
        let mut batch = HashMap::new();
        let zone_id = ZoneId::new();
        apply_delta(
            &mut batch,
            zone_id,
            ZoneDelta {
                reserved: 2,
                confirmed: 0,
                cancelled: 0,
            },
        );
        apply_delta(
            &mut batch,
            zone_id,
            ZoneDelta {
                reserved: 0,
                confirmed: 1,
                cancelled: 0,
            },
        );
        let entry = batch.get(&zone_id).expect("entry present");
        assert_eq!(entry.reserved, 2);
        assert_eq!(entry.confirmed, 1);
    }
}
