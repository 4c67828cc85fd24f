//! Wires the saga reducer to a running [`Store`] and to the step-worker
//! acknowledgement topics.

use std::sync::Arc;

use composable_rust_core::event::{Event as _, SerializedEvent};
use composable_rust_core::event_bus::EventBus;
use composable_rust_runtime::Store;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::store::SagaStoreError;
use super::{SagaAction, SagaEnvironment, SagaInstanceState, SagaMap, SagaReducer};
use crate::bus::{SagaMessage, SAGA_EVENTS_FAILURE, SAGA_EVENTS_SUCCESS};
use crate::types::{BookingId, EventId, SagaId, UserId, ZoneId};

/// Runs the saga orchestrator: owns the reducer `Store` and the background
/// loop that turns step-worker acknowledgements into store actions.
#[derive(Clone)]
pub struct SagaOrchestrator {
    store: Arc<Store<SagaMap, SagaAction, SagaEnvironment, SagaReducer>>,
    event_bus: Arc<dyn EventBus>,
}

impl SagaOrchestrator {
    /// Build an orchestrator over a fresh, empty working set.
    #[must_use]
    pub fn new(environment: SagaEnvironment) -> Self {
        let event_bus = Arc::clone(&environment.event_bus);
        let store = Store::new(SagaMap::new(), SagaReducer, environment);
        Self {
            store: Arc::new(store),
            event_bus,
        }
    }

    /// Build an orchestrator whose working set is repopulated from every
    /// non-terminal row in `saga_instances`, so a process restart resumes
    /// driving sagas that were mid-flight at the time it went down instead
    /// of abandoning them silently.
    ///
    /// # Errors
    /// Returns an error if listing in-flight rows or decoding a snapshot
    /// fails.
    pub async fn restore(environment: SagaEnvironment) -> Result<Self, SagaStoreError> {
        let rows = environment.store.load_in_flight().await?;
        let mut state = SagaMap::new();
        for row in rows {
            match serde_json::from_value::<SagaInstanceState>(row.payload) {
                Ok(snapshot) => {
                    state.insert(row.id, snapshot);
                }
                Err(err) => {
                    warn!(%err, saga_id = %row.id, "dropping saga row with an undecodable snapshot");
                }
            }
        }
        info!(restored = state.len(), "restored in-flight saga instances");

        let event_bus = Arc::clone(&environment.event_bus);
        let store = Store::new(state, SagaReducer, environment);
        Ok(Self {
            store: Arc::new(store),
            event_bus,
        })
    }

    /// Begin a new saga for a just-reserved booking.
    pub async fn start(
        &self,
        booking_id: BookingId,
        user_id: UserId,
        event_id: EventId,
        zone_id: ZoneId,
        quantity: u32,
        amount_minor_units: i64,
    ) -> SagaId {
        let saga_id = SagaId::new();
        self.store
            .send(SagaAction::Start {
                saga_id,
                booking_id,
                user_id,
                event_id,
                zone_id,
                quantity,
                amount_minor_units,
            })
            .await;
        saga_id
    }

    /// Current snapshot of one saga instance, if known to this process.
    pub async fn instance(&self, saga_id: SagaId) -> Option<SagaInstanceState> {
        self.store.state(|s| s.get(&saga_id).cloned()).await
    }

    /// Subscribe to step-worker acknowledgement topics and feed the
    /// corresponding action back into the store until `shutdown` fires.
    pub async fn run_ack_consumer(&self, mut shutdown: broadcast::Receiver<()>) {
        let topics = [SAGA_EVENTS_SUCCESS, SAGA_EVENTS_FAILURE];
        let mut stream = match self.event_bus.subscribe(&topics).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, "failed to subscribe to saga acknowledgement topics");
                return;
            }
        };

        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(serialized)) => self.handle_serialized_ack(&serialized).await,
                        Some(Err(err)) => warn!(%err, "saga acknowledgement stream error"),
                        None => {
                            warn!("saga acknowledgement stream ended, reconnecting");
                            match self.event_bus.subscribe(&topics).await {
                                Ok(new_stream) => stream = new_stream,
                                Err(err) => {
                                    error!(%err, "failed to resubscribe to saga acknowledgements");
                                    return;
                                }
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    }

    async fn handle_serialized_ack(&self, serialized: &SerializedEvent) {
        let message = match SagaMessage::from_bytes(&serialized.data) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "failed to decode saga acknowledgement");
                return;
            }
        };

        let SagaMessage::StepAcknowledged {
            saga_id,
            step,
            succeeded,
            detail,
        } = message
        else {
            warn!("ignoring non-acknowledgement message on saga ack topic");
            return;
        };

        let Some(action) = ack_to_action(saga_id, &step, succeeded, detail) else {
            warn!(%saga_id, step, "unrecognized saga step in acknowledgement");
            return;
        };

        self.store.send(action).await;
    }
}

/// Translate a step worker's acknowledgement into the reducer action that
/// advances (or compensates) the named step.
fn ack_to_action(
    saga_id: SagaId,
    step: &str,
    succeeded: bool,
    detail: Option<String>,
) -> Option<SagaAction> {
    let reason = || detail.clone().unwrap_or_else(|| format!("{step} failed"));

    match (step, succeeded) {
        ("charge_payment", true) => detail
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .map(|uuid| SagaAction::PaymentCharged {
                saga_id,
                payment_id: crate::types::PaymentId(uuid),
            }),
        ("charge_payment", false) => Some(SagaAction::PaymentChargeFailed {
            saga_id,
            reason: reason(),
        }),
        ("confirm_booking", true) => Some(SagaAction::BookingConfirmed { saga_id }),
        ("confirm_booking", false) => Some(SagaAction::BookingConfirmFailed {
            saga_id,
            reason: reason(),
        }),
        ("refund_payment", true) => Some(SagaAction::PaymentRefunded { saga_id }),
        ("refund_payment", false) => Some(SagaAction::RefundFailed {
            saga_id,
            reason: reason(),
        }),
        ("release_inventory", true) => Some(SagaAction::InventoryReleased { saga_id }),
        ("release_inventory", false) => Some(SagaAction::InventoryReleaseFailed {
            saga_id,
            reason: reason(),
        }),
        ("notify_user", _) => Some(SagaAction::UserNotified { saga_id }),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn payment_charge_success_requires_a_parseable_payment_id() {
        assert!(ack_to_action(SagaId::new(), "charge_payment", true, None).is_none());
        let payment_id = crate::types::PaymentId::new();
        let action = ack_to_action(
            SagaId::new(),
            "charge_payment",
            true,
            Some(payment_id.to_string()),
        );
        assert!(matches!(action, Some(SagaAction::PaymentCharged { .. })));
    }

    #[test]
    fn unknown_step_names_are_rejected() {
        assert!(ack_to_action(SagaId::new(), "teleport_customer", true, None).is_none());
    }
}
