//! Saga Orchestrator: drives a booking from a successful reservation
//! through payment and confirmation, compensating in reverse order if any
//! step fails.
//!
//! ```text
//! Start ─► ChargingPayment ─► ConfirmingBooking ─► NotifyingSuccess ─► Completed
//!              │ fail                │ fail
//!              ▼                     ▼
//!       ReleasingInventory   RefundingPayment ─► ReleasingInventory
//!              │                                        │
//!              └────────────► NotifyingFailure ◄─────────┘
//!                                   │
//!                                   ▼
//!                              Compensated
//! ```

mod orchestrator;
mod store;
mod workers;

pub use orchestrator::SagaOrchestrator;
pub use store::{SagaRow, SagaStore, SagaStoreError};
pub use workers::SagaStepWorkers;

use std::collections::HashMap;
use std::sync::Arc;

use composable_rust_core::effect::Effect;
use composable_rust_core::environment::Clock;
use composable_rust_core::event::SerializedEvent;
use composable_rust_core::event_bus::EventBus;
use composable_rust_core::reducer::Reducer;
use composable_rust_macros::Action;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::bus::{saga_command_topic, SagaMessage, SAGA_DLQ};
use crate::types::{BookingId, EventId, SagaId, SagaStatus, UserId, ZoneId};

/// In-memory (and persisted-snapshot) state of one saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SagaInstanceState {
    /// Payment command has been dispatched, awaiting the step worker's ack.
    ChargingPayment {
        /// Booking under the saga's control.
        booking_id: BookingId,
        /// Owning user, notified on completion either way.
        user_id: UserId,
        /// Event the booking belongs to, for inventory compensation.
        event_id: EventId,
        /// Zone reserved, for inventory compensation.
        zone_id: ZoneId,
        /// Tickets reserved, for inventory compensation.
        quantity: u32,
        /// Amount charged, in minor currency units.
        amount_minor_units: i64,
    },
    /// Payment succeeded; confirm-booking command dispatched.
    ConfirmingBooking {
        /// See [`Self::ChargingPayment`].
        booking_id: BookingId,
        /// See [`Self::ChargingPayment`].
        user_id: UserId,
        /// See [`Self::ChargingPayment`].
        event_id: EventId,
        /// See [`Self::ChargingPayment`].
        zone_id: ZoneId,
        /// See [`Self::ChargingPayment`].
        quantity: u32,
        /// Payment reference from the charge step.
        payment_id: crate::types::PaymentId,
    },
    /// Booking confirmed; success notification dispatched.
    NotifyingSuccess {
        /// See [`Self::ChargingPayment`].
        booking_id: BookingId,
        /// See [`Self::ChargingPayment`].
        user_id: UserId,
        /// Payment reference, included in the notification.
        payment_id: crate::types::PaymentId,
    },
    /// Terminal: saga completed successfully.
    Completed {
        /// Booking the saga drove to confirmation.
        booking_id: BookingId,
        /// Payment reference.
        payment_id: crate::types::PaymentId,
    },
    /// Payment succeeded but confirmation failed; refund dispatched.
    RefundingPayment {
        /// See [`Self::ChargingPayment`].
        booking_id: BookingId,
        /// See [`Self::ChargingPayment`].
        user_id: UserId,
        /// See [`Self::ChargingPayment`].
        event_id: EventId,
        /// See [`Self::ChargingPayment`].
        zone_id: ZoneId,
        /// See [`Self::ChargingPayment`].
        quantity: u32,
        /// Payment reference being refunded.
        payment_id: crate::types::PaymentId,
        /// Human-readable reason compensation began.
        reason: String,
    },
    /// Inventory release has been dispatched as part of compensation.
    ReleasingInventory {
        /// See [`Self::ChargingPayment`].
        booking_id: BookingId,
        /// See [`Self::ChargingPayment`].
        user_id: UserId,
        /// See [`Self::ChargingPayment`].
        event_id: EventId,
        /// See [`Self::ChargingPayment`].
        zone_id: ZoneId,
        /// See [`Self::ChargingPayment`].
        quantity: u32,
        /// Reason compensation began.
        reason: String,
    },
    /// Failure notification dispatched; awaiting ack before closing out.
    NotifyingFailure {
        /// See [`Self::ChargingPayment`].
        booking_id: BookingId,
        /// See [`Self::ChargingPayment`].
        user_id: UserId,
        /// Reason compensation began.
        reason: String,
    },
    /// Terminal: saga failed and all compensations acknowledged.
    Compensated {
        /// Booking the saga failed to confirm.
        booking_id: BookingId,
        /// Reason compensation began.
        reason: String,
    },
    /// Terminal: a compensating step itself failed. Money or inventory may
    /// still be held; this needs a human, not another retry from here.
    Stuck {
        /// Booking the saga could not finish compensating.
        booking_id: BookingId,
        /// Owning user.
        user_id: UserId,
        /// The compensating step's failure detail.
        reason: String,
    },
}

impl SagaInstanceState {
    /// Coarse status for the persisted row and for dashboards.
    #[must_use]
    pub const fn status(&self) -> SagaStatus {
        match self {
            Self::ChargingPayment { .. } | Self::ConfirmingBooking { .. } => SagaStatus::Running,
            Self::NotifyingSuccess { .. } => SagaStatus::Running,
            Self::Completed { .. } => SagaStatus::Completed,
            Self::RefundingPayment { .. }
            | Self::ReleasingInventory { .. }
            | Self::NotifyingFailure { .. } => SagaStatus::Compensating,
            Self::Compensated { .. } => SagaStatus::Compensated,
            Self::Stuck { .. } => SagaStatus::Stuck,
        }
    }

    /// The booking this saga instance concerns, present in every variant.
    #[must_use]
    pub const fn booking_id(&self) -> BookingId {
        match self {
            Self::ChargingPayment { booking_id, .. }
            | Self::ConfirmingBooking { booking_id, .. }
            | Self::NotifyingSuccess { booking_id, .. }
            | Self::Completed { booking_id, .. }
            | Self::RefundingPayment { booking_id, .. }
            | Self::ReleasingInventory { booking_id, .. }
            | Self::NotifyingFailure { booking_id, .. }
            | Self::Compensated { booking_id, .. }
            | Self::Stuck { booking_id, .. } => *booking_id,
        }
    }
}

/// Commands and step acknowledgements the orchestrator's reducer handles.
#[derive(Debug, Clone, Serialize, Deserialize, Action)]
pub enum SagaAction {
    /// Command: begin a new saga for a just-reserved booking.
    #[command]
    Start {
        /// Newly allocated saga identifier.
        saga_id: SagaId,
        /// Booking to drive to confirmation.
        booking_id: BookingId,
        /// Owning user.
        user_id: UserId,
        /// Event booked.
        event_id: EventId,
        /// Zone reserved.
        zone_id: ZoneId,
        /// Tickets reserved.
        quantity: u32,
        /// Amount to charge, in minor currency units.
        amount_minor_units: i64,
    },
    /// Event: the payment step worker charged the customer successfully.
    #[event]
    PaymentCharged {
        /// Saga this ack belongs to.
        saga_id: SagaId,
        /// Payment reference.
        payment_id: crate::types::PaymentId,
    },
    /// Event: the payment step worker could not charge the customer.
    #[event]
    PaymentChargeFailed {
        /// Saga this ack belongs to.
        saga_id: SagaId,
        /// Failure detail.
        reason: String,
    },
    /// Event: the confirmation step worker confirmed the booking.
    #[event]
    BookingConfirmed {
        /// Saga this ack belongs to.
        saga_id: SagaId,
    },
    /// Event: the confirmation step worker failed to confirm the booking.
    #[event]
    BookingConfirmFailed {
        /// Saga this ack belongs to.
        saga_id: SagaId,
        /// Failure detail.
        reason: String,
    },
    /// Event: the payment step worker completed a refund.
    #[event]
    PaymentRefunded {
        /// Saga this ack belongs to.
        saga_id: SagaId,
    },
    /// Event: the payment step worker could not complete the refund.
    #[event]
    RefundFailed {
        /// Saga this ack belongs to.
        saga_id: SagaId,
        /// Failure detail.
        reason: String,
    },
    /// Event: inventory was released back to its zone.
    #[event]
    InventoryReleased {
        /// Saga this ack belongs to.
        saga_id: SagaId,
    },
    /// Event: the inventory step worker could not release the hold.
    #[event]
    InventoryReleaseFailed {
        /// Saga this ack belongs to.
        saga_id: SagaId,
        /// Failure detail.
        reason: String,
    },
    /// Event: the notification step worker delivered the outcome.
    #[event]
    UserNotified {
        /// Saga this ack belongs to.
        saga_id: SagaId,
    },
}

impl SagaAction {
    fn saga_id(&self) -> SagaId {
        match self {
            Self::Start { saga_id, .. }
            | Self::PaymentCharged { saga_id, .. }
            | Self::PaymentChargeFailed { saga_id, .. }
            | Self::BookingConfirmed { saga_id }
            | Self::BookingConfirmFailed { saga_id, .. }
            | Self::PaymentRefunded { saga_id }
            | Self::RefundFailed { saga_id, .. }
            | Self::InventoryReleased { saga_id }
            | Self::InventoryReleaseFailed { saga_id, .. }
            | Self::UserNotified { saga_id } => *saga_id,
        }
    }
}

/// Dependencies injected into the saga reducer.
#[derive(Clone)]
pub struct SagaEnvironment {
    /// Clock, for timestamped log fields.
    pub clock: Arc<dyn Clock>,
    /// Bus used to dispatch step commands.
    pub event_bus: Arc<dyn EventBus>,
    /// Durable snapshot store.
    pub store: SagaStore,
}

/// Reducer driving every saga instance's state machine.
///
/// The store's `State` is the full working set of in-flight sagas, keyed
/// by id, so one `Store` instance serves every saga concurrently; each
/// action is routed to its instance by the `saga_id` it carries.
#[derive(Debug, Clone, Default)]
pub struct SagaReducer;

pub(crate) type SagaMap = HashMap<SagaId, SagaInstanceState>;

impl Reducer for SagaReducer {
    type State = SagaMap;
    type Action = SagaAction;
    type Environment = SagaEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Vec<Effect<Self::Action>> {
        let saga_id = action.saga_id();
        let current = state.get(&saga_id).cloned();

        let (next, effect) = match (current, action) {
            (
                None,
                SagaAction::Start {
                    saga_id,
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    amount_minor_units,
                },
            ) => {
                let next = SagaInstanceState::ChargingPayment {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    amount_minor_units,
                };
                let effect = dispatch(
                    env,
                    saga_id,
                    booking_id,
                    &next,
                    SagaMessage::ChargePayment {
                        saga_id,
                        booking_id,
                        amount_minor_units,
                    },
                    "charge_payment",
                );
                (next, effect)
            }

            (
                Some(SagaInstanceState::ChargingPayment {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    ..
                }),
                SagaAction::PaymentCharged { payment_id, .. },
            ) => {
                let next = SagaInstanceState::ConfirmingBooking {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    payment_id,
                };
                let effect = dispatch(
                    env,
                    saga_id,
                    booking_id,
                    &next,
                    SagaMessage::ConfirmBooking {
                        saga_id,
                        booking_id,
                        payment_id,
                    },
                    "confirm_booking",
                );
                (next, effect)
            }

            (
                Some(SagaInstanceState::ChargingPayment {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    ..
                }),
                SagaAction::PaymentChargeFailed { reason, .. },
            ) => {
                let next = SagaInstanceState::ReleasingInventory {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    reason: reason.clone(),
                };
                let effect = dispatch(
                    env,
                    saga_id,
                    booking_id,
                    &next,
                    SagaMessage::ReleaseInventory {
                        saga_id,
                        booking_id,
                        zone_id,
                        quantity,
                    },
                    "release_inventory",
                );
                (next, effect)
            }

            (
                Some(SagaInstanceState::ConfirmingBooking {
                    booking_id,
                    user_id,
                    payment_id,
                    ..
                }),
                SagaAction::BookingConfirmed { .. },
            ) => {
                let next = SagaInstanceState::NotifyingSuccess {
                    booking_id,
                    user_id,
                    payment_id,
                };
                let effect = dispatch(
                    env,
                    saga_id,
                    booking_id,
                    &next,
                    SagaMessage::NotifyUser {
                        saga_id,
                        booking_id,
                        user_id,
                        succeeded: true,
                    },
                    "notify_user",
                );
                (next, effect)
            }

            (
                Some(SagaInstanceState::ConfirmingBooking {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    payment_id,
                }),
                SagaAction::BookingConfirmFailed { reason, .. },
            ) => {
                let next = SagaInstanceState::RefundingPayment {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    payment_id,
                    reason: reason.clone(),
                };
                let effect = dispatch(
                    env,
                    saga_id,
                    booking_id,
                    &next,
                    SagaMessage::RefundPayment {
                        saga_id,
                        booking_id,
                        payment_id,
                    },
                    "refund_payment",
                );
                (next, effect)
            }

            (
                Some(SagaInstanceState::NotifyingSuccess {
                    booking_id,
                    payment_id,
                    ..
                }),
                SagaAction::UserNotified { .. },
            ) => {
                let next = SagaInstanceState::Completed {
                    booking_id,
                    payment_id,
                };
                let effect = persist(env, saga_id, booking_id, &next);
                (next, effect)
            }

            (
                Some(SagaInstanceState::RefundingPayment {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    reason,
                    ..
                }),
                SagaAction::PaymentRefunded { .. },
            ) => {
                let next = SagaInstanceState::ReleasingInventory {
                    booking_id,
                    user_id,
                    event_id,
                    zone_id,
                    quantity,
                    reason: reason.clone(),
                };
                let effect = dispatch(
                    env,
                    saga_id,
                    booking_id,
                    &next,
                    SagaMessage::ReleaseInventory {
                        saga_id,
                        booking_id,
                        zone_id,
                        quantity,
                    },
                    "release_inventory",
                );
                (next, effect)
            }

            (
                Some(SagaInstanceState::ReleasingInventory {
                    booking_id,
                    user_id,
                    reason,
                    ..
                }),
                SagaAction::InventoryReleased { .. },
            ) => {
                let next = SagaInstanceState::NotifyingFailure {
                    booking_id,
                    user_id,
                    reason: reason.clone(),
                };
                let effect = dispatch(
                    env,
                    saga_id,
                    booking_id,
                    &next,
                    SagaMessage::NotifyUser {
                        saga_id,
                        booking_id,
                        user_id,
                        succeeded: false,
                    },
                    "notify_user",
                );
                (next, effect)
            }

            (
                Some(SagaInstanceState::NotifyingFailure {
                    booking_id, reason, ..
                }),
                SagaAction::UserNotified { .. },
            ) => {
                let next = SagaInstanceState::Compensated {
                    booking_id,
                    reason: reason.clone(),
                };
                let effect = persist(env, saga_id, booking_id, &next);
                (next, effect)
            }

            (
                Some(SagaInstanceState::RefundingPayment {
                    booking_id, user_id, ..
                }),
                SagaAction::RefundFailed { reason, .. },
            ) => {
                let next = SagaInstanceState::Stuck {
                    booking_id,
                    user_id,
                    reason: reason.clone(),
                };
                let effect =
                    dead_letter(env, saga_id, booking_id, &next, "refund_payment", reason);
                (next, effect)
            }

            (
                Some(SagaInstanceState::ReleasingInventory {
                    booking_id, user_id, ..
                }),
                SagaAction::InventoryReleaseFailed { reason, .. },
            ) => {
                let next = SagaInstanceState::Stuck {
                    booking_id,
                    user_id,
                    reason: reason.clone(),
                };
                let effect =
                    dead_letter(env, saga_id, booking_id, &next, "release_inventory", reason);
                (next, effect)
            }

            (Some(existing), _) => {
                warn!(%saga_id, state = ?existing, "ignoring action not valid in current saga state");
                return vec![Effect::None];
            }

            (None, _) => {
                warn!(%saga_id, "ignoring action for unknown saga instance");
                return vec![Effect::None];
            }
        };

        state.insert(saga_id, next);
        vec![effect]
    }
}

/// Persist the new state and publish `message` to its step topic.
fn dispatch(
    env: &SagaEnvironment,
    saga_id: SagaId,
    booking_id: BookingId,
    next: &SagaInstanceState,
    message: SagaMessage,
    step: &'static str,
) -> Effect<SagaAction> {
    let store = env.store.clone();
    let bus = Arc::clone(&env.event_bus);
    let status = next.status().to_string();
    let snapshot = next.clone();

    Effect::Future(Box::pin(async move {
        if let Err(err) = store.save(saga_id, booking_id, &status, &snapshot).await {
            error!(%err, %saga_id, "failed to persist saga snapshot");
        }

        let serialized = match SerializedEvent::from_event(&message, None) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(%err, %saga_id, "failed to serialize saga command");
                return None;
            }
        };

        if let Err(err) = bus.publish(&saga_command_topic(step), &serialized).await {
            error!(%err, %saga_id, step, "failed to publish saga command");
        }

        None
    }))
}

/// Persist a terminal snapshot with no further command to dispatch.
fn persist(
    env: &SagaEnvironment,
    saga_id: SagaId,
    booking_id: BookingId,
    next: &SagaInstanceState,
) -> Effect<SagaAction> {
    let store = env.store.clone();
    let status = next.status().to_string();
    let snapshot = next.clone();

    Effect::Future(Box::pin(async move {
        if let Err(err) = store.save(saga_id, booking_id, &status, &snapshot).await {
            error!(%err, %saga_id, "failed to persist saga snapshot");
        }
        None
    }))
}

/// Persist a `Stuck` snapshot and park the failed compensating step on the
/// dead letter queue for operator follow-up.
fn dead_letter(
    env: &SagaEnvironment,
    saga_id: SagaId,
    booking_id: BookingId,
    next: &SagaInstanceState,
    step: &'static str,
    reason: String,
) -> Effect<SagaAction> {
    let store = env.store.clone();
    let bus = Arc::clone(&env.event_bus);
    let status = next.status().to_string();
    let snapshot = next.clone();

    Effect::Future(Box::pin(async move {
        if let Err(err) = store.save(saga_id, booking_id, &status, &snapshot).await {
            error!(%err, %saga_id, "failed to persist saga snapshot");
        }

        let ack = SagaMessage::StepAcknowledged {
            saga_id,
            step: step.to_string(),
            succeeded: false,
            detail: Some(reason),
        };
        match SerializedEvent::from_event(&ack, None) {
            Ok(serialized) => {
                if let Err(err) = bus.publish(SAGA_DLQ, &serialized).await {
                    error!(%err, %saga_id, step, "failed to publish to dead letter queue");
                }
            }
            Err(err) => error!(%err, %saga_id, step, "failed to serialize dead-lettered step failure"),
        }

        warn!(%saga_id, step, "compensating step failed; saga parked as stuck for manual intervention");
        None
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use composable_rust_testing::mocks::InMemoryEventBus;
    use composable_rust_testing::test_clock;

    fn env() -> SagaEnvironment {
        SagaEnvironment {
            clock: Arc::new(test_clock()),
            event_bus: Arc::new(InMemoryEventBus::new()),
            store: SagaStore::new(sqlx::PgPool::connect_lazy("postgres://localhost/test").expect("lazy pool")),
        }
    }

    #[test]
    fn start_transitions_to_charging_payment() {
        let reducer = SagaReducer;
        let mut state = SagaMap::new();
        let env = env();
        let saga_id = SagaId::new();
        let booking_id = BookingId::new();

        let effects = reducer.reduce(
            &mut state,
            SagaAction::Start {
                saga_id,
                booking_id,
                user_id: UserId::new(),
                event_id: EventId::new(),
                zone_id: ZoneId::new(),
                quantity: 2,
                amount_minor_units: 5000,
            },
            &env,
        );

        assert_eq!(effects.len(), 1);
        assert!(matches!(
            state.get(&saga_id),
            Some(SagaInstanceState::ChargingPayment { .. })
        ));
    }

    #[test]
    fn payment_charge_failure_routes_straight_to_inventory_release() {
        let reducer = SagaReducer;
        let mut state = SagaMap::new();
        let env = env();
        let saga_id = SagaId::new();
        let booking_id = BookingId::new();

        reducer.reduce(
            &mut state,
            SagaAction::Start {
                saga_id,
                booking_id,
                user_id: UserId::new(),
                event_id: EventId::new(),
                zone_id: ZoneId::new(),
                quantity: 1,
                amount_minor_units: 1000,
            },
            &env,
        );

        reducer.reduce(
            &mut state,
            SagaAction::PaymentChargeFailed {
                saga_id,
                reason: "card declined".to_string(),
            },
            &env,
        );

        assert!(matches!(
            state.get(&saga_id),
            Some(SagaInstanceState::ReleasingInventory { .. })
        ));
    }

    #[test]
    fn action_for_unknown_saga_is_ignored_without_panicking() {
        let reducer = SagaReducer;
        let mut state = SagaMap::new();
        let env = env();

        let effects = reducer.reduce(
            &mut state,
            SagaAction::UserNotified {
                saga_id: SagaId::new(),
            },
            &env,
        );

        assert_eq!(effects.len(), 1);
        assert!(state.is_empty());
    }
}
