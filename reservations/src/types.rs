//! Domain value objects and entities.
//!
//! Zone-level inventory only: a `Zone` tracks fungible quantity, never
//! individual seat identities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(BookingId);
uuid_id!(UserId);
uuid_id!(EventId);
uuid_id!(ShowId);
uuid_id!(ZoneId);
uuid_id!(PaymentId);
uuid_id!(SagaId);

/// Monetary amount in minor currency units (e.g. cents), to avoid float
/// rounding in price arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    /// Zero amount.
    pub const ZERO: Self = Self(0);

    /// Multiply a unit price by a quantity.
    #[must_use]
    pub fn times(self, quantity: u32) -> Self {
        Self(self.0 * i64::from(quantity))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0.abs() % 100)
    }
}

/// Lifecycle status of a booking. No transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Held against inventory, pending payment/confirmation.
    Reserved,
    /// Terminal-success.
    Confirmed,
    /// Terminal-user-initiated.
    Cancelled,
    /// Terminal-timeout.
    Expired,
}

impl BookingStatus {
    /// Whether this status can never transition further.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reserved => "reserved",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// The durable record of a single ticket booking.
///
/// `booking_id` is the single name used end-to-end for this entity — in
/// saga data, bus payloads, and HTTP responses alike; `reservation_id` is
/// never introduced as a synonym.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    /// Unique identifier.
    pub id: BookingId,
    /// Owning user. Ownership checks are mandatory on every mutation.
    pub user_id: UserId,
    /// Event the booking is for.
    pub event_id: EventId,
    /// Specific show/performance.
    pub show_id: ShowId,
    /// Seat zone.
    pub zone_id: ZoneId,
    /// Number of tickets, 1..N.
    pub quantity: u32,
    /// Price per ticket.
    pub unit_price: Money,
    /// `unit_price * quantity`.
    pub total_price: Money,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Current lifecycle status.
    pub status: BookingStatus,
    /// Client-supplied deduplication key, unique when present.
    pub idempotency_key: Option<String>,
    /// When the reservation was created.
    pub reserved_at: DateTime<Utc>,
    /// Deadline after which the reservation is reclaimable.
    pub expires_at: DateTime<Utc>,
    /// When it was confirmed, if ever.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When it was cancelled, if ever.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Payment gateway reference, once known.
    pub payment_id: Option<PaymentId>,
    /// Short confirmation code shown to the user.
    pub confirmation_code: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Per-status ticket counts for one user within one event, used by the
/// booking summary endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BookingSummary {
    /// Event these counts are scoped to.
    pub event_id: EventId,
    /// Tickets currently held in `Reserved` bookings.
    pub reserved: u32,
    /// Tickets in `Confirmed` bookings.
    pub confirmed: u32,
    /// Tickets in `Cancelled` bookings.
    pub cancelled: u32,
    /// Tickets in `Expired` bookings.
    pub expired: u32,
}

/// Per (event, user) queue entry. At most one live entry per pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Opaque 128-bit token proving ownership of this queue slot.
    pub token: String,
    /// When the user joined the queue.
    pub joined_at: DateTime<Utc>,
    /// When this queue entry itself expires if never admitted.
    pub expires_at: DateTime<Utc>,
}

/// Claims carried by a signed queue-pass JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePassClaims {
    /// Subject = user id (duplicated per JWT convention alongside `user_id`).
    pub sub: String,
    /// User the pass admits.
    pub user_id: UserId,
    /// Event the pass admits a reservation attempt for.
    pub event_id: EventId,
    /// Always `"queue_pass"`.
    pub purpose: String,
    /// Issuer: `"booking-service"` or `"queue-release-worker"`.
    pub iss: String,
    /// Unique token id (128-bit hex), used as the single-use revocation key.
    pub jti: String,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Not-before (unix seconds).
    pub nbf: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Outcome of a saga step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step succeeded.
    Success,
    /// The step failed.
    Failure,
}

/// Status of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Instance persisted, first command not yet emitted.
    Pending,
    /// At least one command has been emitted.
    Running,
    /// All steps succeeded.
    Completed,
    /// A critical step failed; compensation is about to start.
    Failed,
    /// Compensating commands are in flight.
    Compensating,
    /// All compensations acknowledged.
    Compensated,
    /// A compensating step itself failed; stuck pending manual intervention.
    Stuck,
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Stuck => "stuck",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn booking_status_terminality() {
        assert!(!BookingStatus::Reserved.is_terminal());
        assert!(BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::Expired.is_terminal());
    }

    #[test]
    fn money_times_quantity() {
        assert_eq!(Money(1500).times(3), Money(4500));
    }

    #[test]
    fn money_display_formats_minor_units() {
        assert_eq!(Money(12345).to_string(), "123.45");
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(BookingId::new(), BookingId::new());
    }
}
