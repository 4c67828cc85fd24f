//! Bus topic names and the domain events published to them.

use composable_rust_core::event::Event;
use serde::{Deserialize, Serialize};

use crate::types::{BookingId, EventId, PaymentId, SagaId, UserId, ZoneId};

/// Topic carrying forward saga step commands, `saga.commands.<step>`.
pub fn saga_command_topic(step: &str) -> String {
    format!("saga.commands.{step}")
}

/// Topic carrying successful saga step acknowledgements.
pub const SAGA_EVENTS_SUCCESS: &str = "saga.events.success";

/// Topic carrying failed saga step acknowledgements.
pub const SAGA_EVENTS_FAILURE: &str = "saga.events.failure";

/// Topic carrying compensation commands for a given step.
pub fn saga_compensation_topic(step: &str) -> String {
    format!("saga.events.compensation.{step}")
}

/// Topic a saga step publishes to when it exhausts its retry budget and is
/// parked for manual inspection.
pub const SAGA_DLQ: &str = "saga.dlq";

/// Topic carrying booking lifecycle events, consumed by the reconciliation
/// worker and any other downstream readers.
pub const BOOKING_EVENTS: &str = "booking.events";

/// Topic an external notification dispatcher (email/SMS, out of scope here)
/// consumes to actually tell the user their booking's outcome.
pub const USER_NOTIFICATIONS: &str = "user.notifications";

/// A request to tell a user the outcome of their booking, published by the
/// saga's `send-notification` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotification {
    /// Booking the notification concerns.
    pub booking_id: BookingId,
    /// User to notify.
    pub user_id: UserId,
    /// Whether the saga that produced this notification ultimately succeeded.
    pub booking_succeeded: bool,
}

impl Event for UserNotification {
    fn event_type(&self) -> &'static str {
        "UserNotification.v1"
    }
}

/// Domain events describing booking lifecycle transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BookingEvent {
    /// A reservation was created and inventory debited.
    Created {
        /// Booking affected.
        booking_id: BookingId,
        /// Owning user.
        user_id: UserId,
        /// Event booked.
        event_id: EventId,
        /// Zone reserved from.
        zone_id: ZoneId,
        /// Ticket count.
        quantity: u32,
    },
    /// A reservation was confirmed after successful payment.
    Confirmed {
        /// Booking affected.
        booking_id: BookingId,
        /// Payment reference.
        payment_id: PaymentId,
        /// Zone the booking was drawn from.
        zone_id: ZoneId,
        /// Ticket count confirmed.
        quantity: u32,
    },
    /// A reservation was cancelled by its owner.
    Cancelled {
        /// Booking affected.
        booking_id: BookingId,
        /// Zone whose inventory was released.
        zone_id: ZoneId,
        /// Ticket count released.
        quantity: u32,
    },
    /// A reservation's hold expired without confirmation.
    Expired {
        /// Booking affected.
        booking_id: BookingId,
        /// Zone whose inventory was released.
        zone_id: ZoneId,
        /// Ticket count released.
        quantity: u32,
    },
}

impl Event for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "BookingCreated.v1",
            Self::Confirmed { .. } => "BookingConfirmed.v1",
            Self::Cancelled { .. } => "BookingCancelled.v1",
            Self::Expired { .. } => "BookingExpired.v1",
        }
    }
}

/// Commands and acknowledgements exchanged between the saga orchestrator
/// and its step workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SagaMessage {
    /// Instructs the payment step worker to charge the customer.
    ChargePayment {
        /// Saga this command belongs to.
        saga_id: SagaId,
        /// Booking being paid for.
        booking_id: BookingId,
        /// Amount in minor units.
        amount_minor_units: i64,
    },
    /// Instructs the payment step worker to refund a charge.
    RefundPayment {
        /// Saga this command belongs to.
        saga_id: SagaId,
        /// Booking being refunded.
        booking_id: BookingId,
        /// Payment reference to refund.
        payment_id: PaymentId,
    },
    /// Instructs the confirmation step to mark a booking confirmed.
    ConfirmBooking {
        /// Saga this command belongs to.
        saga_id: SagaId,
        /// Booking to confirm.
        booking_id: BookingId,
        /// Payment reference that authorized confirmation.
        payment_id: PaymentId,
    },
    /// Instructs the release step to give inventory back.
    ReleaseInventory {
        /// Saga this command belongs to.
        saga_id: SagaId,
        /// Booking whose inventory should be released.
        booking_id: BookingId,
        /// Zone to credit.
        zone_id: ZoneId,
        /// Ticket count to credit.
        quantity: u32,
    },
    /// Instructs the notification step to tell the user the outcome.
    NotifyUser {
        /// Saga this command belongs to.
        saga_id: SagaId,
        /// Booking the notification concerns.
        booking_id: BookingId,
        /// User to notify.
        user_id: UserId,
        /// Whether the saga ultimately succeeded.
        succeeded: bool,
    },
    /// A step worker's acknowledgement that its command completed.
    StepAcknowledged {
        /// Saga this acknowledgement belongs to.
        saga_id: SagaId,
        /// Name of the step that completed, e.g. `"charge_payment"`.
        step: String,
        /// Whether the step succeeded.
        succeeded: bool,
        /// Human-readable failure detail, if any.
        detail: Option<String>,
    },
}

impl Event for SagaMessage {
    fn event_type(&self) -> &'static str {
        match self {
            Self::ChargePayment { .. } => "SagaChargePayment.v1",
            Self::RefundPayment { .. } => "SagaRefundPayment.v1",
            Self::ConfirmBooking { .. } => "SagaConfirmBooking.v1",
            Self::ReleaseInventory { .. } => "SagaReleaseInventory.v1",
            Self::NotifyUser { .. } => "SagaNotifyUser.v1",
            Self::StepAcknowledged { .. } => "SagaStepAcknowledged.v1",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn saga_command_topic_is_namespaced_per_step() {
        assert_eq!(saga_command_topic("charge_payment"), "saga.commands.charge_payment");
    }

    #[test]
    fn saga_compensation_topic_is_namespaced_per_step() {
        assert_eq!(
            saga_compensation_topic("charge_payment"),
            "saga.events.compensation.charge_payment"
        );
    }

    #[test]
    fn booking_event_type_strings_are_versioned() {
        let event = BookingEvent::Cancelled {
            booking_id: BookingId::new(),
            zone_id: ZoneId::new(),
            quantity: 1,
        };
        assert_eq!(event.event_type(), "BookingCancelled.v1");
    }
}
