//! Reservation Service: orchestrates the Atomic Inventory Store and the
//! Reservation Repository behind a single consistent API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use composable_rust_core::event::SerializedEvent;
use composable_rust_core::event_bus::EventBus;
use rand::RngCore;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bus::{BookingEvent, BOOKING_EVENTS};
use crate::inventory::{AisError, AtomicInventoryStore};
use crate::repository::{NewBooking, ReservationRepository, ReservationRepositoryError};
use crate::types::{Booking, BookingId, BookingSummary, EventId, Money, PaymentId, ShowId, UserId, ZoneId};

/// Errors surfaced by the Reservation Service.
#[derive(Debug, Error)]
pub enum ReservationServiceError {
    /// Requested ticket quantity was not positive.
    #[error("quantity must be greater than zero")]
    InvalidQuantity,
    /// The requested zone does not have enough available tickets.
    #[error("insufficient inventory")]
    InsufficientInventory,
    /// The requested zone was never initialized in the inventory store.
    #[error("zone not found")]
    ZoneNotFound,
    /// Admitting this reservation would push the user over their per-event cap.
    #[error("user ticket cap exceeded: {current} + {requested} > {cap}")]
    TicketCapExceeded {
        /// Tickets the user currently holds.
        current: u32,
        /// Tickets requested in this call.
        requested: u32,
        /// Configured cap.
        cap: u32,
    },
    /// The booking does not belong to the caller.
    #[error("booking does not belong to this user")]
    NotOwner,
    /// The booking is already in a terminal status that forbids this
    /// transition; carries the status it is already in.
    #[error("booking is already {0}")]
    AlreadyTerminal(crate::types::BookingStatus),
    /// The repository reported the booking does not exist.
    #[error("booking not found")]
    NotFound,
    /// An idempotency key was reused with a since-resolved duplicate request.
    #[error("duplicate request")]
    DuplicateRequest,
    /// An internal failure occurred that callers cannot meaningfully recover
    /// from at the edge (e.g. durable confirm failed after inventory commit).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AisError> for ReservationServiceError {
    fn from(err: AisError) -> Self {
        match err {
            AisError::InvalidQuantity => Self::InvalidQuantity,
            AisError::InsufficientInventory { .. } => Self::InsufficientInventory,
            AisError::UserLimitExceeded { current, requested, cap } => Self::TicketCapExceeded {
                current,
                requested,
                cap,
            },
            AisError::UnknownZone(_) => Self::ZoneNotFound,
            AisError::ReservationNotFound(_) => Self::NotFound,
            AisError::InvalidUser => Self::NotOwner,
            AisError::AlreadyConfirmed => {
                Self::AlreadyTerminal(crate::types::BookingStatus::Confirmed)
            }
            AisError::ReservationExpired => {
                Self::AlreadyTerminal(crate::types::BookingStatus::Expired)
            }
            AisError::AlreadyReleased => {
                Self::AlreadyTerminal(crate::types::BookingStatus::Cancelled)
            }
            other @ AisError::Redis(_) => Self::Internal(other.to_string()),
        }
    }
}

impl From<ReservationRepositoryError> for ReservationServiceError {
    fn from(err: ReservationRepositoryError) -> Self {
        match err {
            ReservationRepositoryError::NotFound(_) => Self::NotFound,
            ReservationRepositoryError::DuplicateIdempotencyKey => Self::DuplicateRequest,
            ReservationRepositoryError::AlreadyTerminal(_, status) => Self::AlreadyTerminal(status),
            ReservationRepositoryError::Database(err) => Self::Internal(err.to_string()),
        }
    }
}

/// Inputs for a new reservation request.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Requesting user.
    pub user_id: UserId,
    /// Event booked.
    pub event_id: EventId,
    /// Specific show.
    pub show_id: ShowId,
    /// Zone to reserve from.
    pub zone_id: ZoneId,
    /// Ticket count.
    pub quantity: u32,
    /// Price per ticket.
    pub unit_price: Money,
    /// Currency code.
    pub currency: String,
    /// Client-supplied dedup key.
    pub idempotency_key: Option<String>,
}

/// Orchestrates inventory and durable storage for the booking lifecycle.
pub struct ReservationService {
    inventory: AtomicInventoryStore,
    repository: ReservationRepository,
    bus: Arc<dyn EventBus>,
    reservation_ttl: Duration,
    per_user_ticket_cap: u32,
    user_count_ttl: Duration,
}

impl ReservationService {
    /// Construct a new service over its dependencies.
    #[must_use]
    pub fn new(
        inventory: AtomicInventoryStore,
        repository: ReservationRepository,
        bus: Arc<dyn EventBus>,
        reservation_ttl: Duration,
        per_user_ticket_cap: u32,
    ) -> Self {
        Self::with_user_count_ttl(
            inventory,
            repository,
            bus,
            reservation_ttl,
            per_user_ticket_cap,
            Duration::from_secs(86_400),
        )
    }

    /// Construct a new service, explicitly overriding the TTL on the AIS
    /// per-user ticket counter (see [`crate::config::InventoryConfig::user_count_ttl`]).
    #[must_use]
    pub fn with_user_count_ttl(
        inventory: AtomicInventoryStore,
        repository: ReservationRepository,
        bus: Arc<dyn EventBus>,
        reservation_ttl: Duration,
        per_user_ticket_cap: u32,
        user_count_ttl: Duration,
    ) -> Self {
        Self {
            inventory,
            repository,
            bus,
            reservation_ttl,
            per_user_ticket_cap,
            user_count_ttl,
        }
    }

    /// Reserve tickets: admits against the Atomic Inventory Store — which
    /// atomically enforces both zone availability and the caller's
    /// per-event cap in a single script invocation, since both checks and
    /// both mutations must be observed as one step — then durably records
    /// the reservation. If the durable write fails after inventory was
    /// debited, the debit is rolled back before the error is surfaced — the
    /// inverse of the post-payment half-confirmed case, which this method
    /// never reaches.
    ///
    /// # Errors
    /// Returns [`ReservationServiceError::TicketCapExceeded`] if the user's
    /// per-event cap would be exceeded, [`ReservationServiceError::InsufficientInventory`]
    /// if the zone cannot satisfy the request, [`ReservationServiceError::DuplicateRequest`]
    /// if the idempotency key was already used, or `Internal` on any other failure.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Booking, ReservationServiceError> {
        if req.quantity == 0 {
            return Err(ReservationServiceError::InvalidQuantity);
        }

        if let Some(key) = &req.idempotency_key {
            if let Some(existing) = self.repository.get_by_idempotency_key(key).await? {
                info!(booking_id = %existing.id, "idempotent reserve replay");
                return Ok(existing);
            }
        }

        let reserved = self
            .inventory
            .reserve(
                req.show_id,
                req.zone_id,
                req.event_id,
                req.user_id,
                req.quantity,
                self.per_user_ticket_cap,
                self.user_count_ttl,
                self.reservation_ttl,
            )
            .await?;

        let expires_at = Utc::now() + self.reservation_ttl;
        let new_booking = NewBooking {
            id: reserved.booking_id,
            user_id: req.user_id,
            event_id: req.event_id,
            show_id: req.show_id,
            zone_id: req.zone_id,
            quantity: req.quantity,
            unit_price: req.unit_price,
            currency: req.currency,
            idempotency_key: req.idempotency_key,
            expires_at,
        };

        let booking = match self.repository.create(new_booking).await {
            Ok(booking) => booking,
            Err(err) => {
                if let Err(release_err) =
                    self.inventory.release(reserved.booking_id, req.user_id).await
                {
                    error!(
                        %release_err,
                        "failed to roll back inventory after a failed durable reserve write"
                    );
                }
                return Err(err.into());
            }
        };

        self.publish(BookingEvent::Created {
            booking_id: booking.id,
            user_id: booking.user_id,
            event_id: booking.event_id,
            zone_id: booking.zone_id,
            quantity: booking.quantity,
        })
        .await;

        Ok(booking)
    }

    /// Confirm a reservation after payment succeeds.
    ///
    /// Inventory was already debited at reserve time, so this only
    /// transitions the durable record. If the durable write fails, the
    /// caller sees `Internal` and must retry the whole confirm — the
    /// inventory-side confirm is idempotent so a retry is always safe.
    ///
    /// # Errors
    /// Returns [`ReservationServiceError::NotOwner`] if `user_id` does not
    /// own the booking, [`ReservationServiceError::AlreadyTerminal`] if the
    /// booking is not currently `Reserved`, or `Internal` on failure.
    pub async fn confirm(
        &self,
        booking_id: BookingId,
        user_id: UserId,
        payment_id: PaymentId,
    ) -> Result<Booking, ReservationServiceError> {
        let existing = self.repository.get_by_id(booking_id).await?;
        if existing.user_id != user_id {
            return Err(ReservationServiceError::NotOwner);
        }
        self.confirm_internal(booking_id, payment_id).await
    }

    /// Confirm a reservation on behalf of the saga orchestrator's
    /// confirm-booking step, without an owning caller to check against —
    /// the saga already established ownership when it started.
    ///
    /// # Errors
    /// Returns [`ReservationServiceError::AlreadyTerminal`] if the booking is
    /// not currently `Reserved`, or `Internal` on failure.
    pub async fn confirm_internal(
        &self,
        booking_id: BookingId,
        payment_id: PaymentId,
    ) -> Result<Booking, ReservationServiceError> {
        let existing = self.repository.get_by_id(booking_id).await?;

        self.inventory
            .confirm(booking_id, existing.user_id, payment_id)
            .await?;

        let confirmation_code = generate_confirmation_code();
        let booking = self
            .repository
            .confirm(booking_id, payment_id, &confirmation_code)
            .await?;

        self.publish(BookingEvent::Confirmed {
            booking_id: booking.id,
            payment_id,
            zone_id: booking.zone_id,
            quantity: booking.quantity,
        })
        .await;

        Ok(booking)
    }

    /// Cancel a reservation on the owner's request, releasing inventory.
    ///
    /// # Errors
    /// Returns [`ReservationServiceError::NotOwner`] if `user_id` does not
    /// own the booking, [`ReservationServiceError::AlreadyTerminal`] if the
    /// booking is already terminal, or `Internal` on failure.
    pub async fn cancel(
        &self,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<Booking, ReservationServiceError> {
        let existing = self.repository.get_by_id(booking_id).await?;
        if existing.user_id != user_id {
            return Err(ReservationServiceError::NotOwner);
        }
        self.cancel_internal(booking_id).await
    }

    /// Cancel a reservation as the saga orchestrator's compensating
    /// release-inventory step, without an owning caller to check against.
    ///
    /// # Errors
    /// Returns [`ReservationServiceError::AlreadyTerminal`] if the booking is
    /// already terminal, or `Internal` on failure.
    pub async fn cancel_internal(
        &self,
        booking_id: BookingId,
    ) -> Result<Booking, ReservationServiceError> {
        let existing = self.repository.get_by_id(booking_id).await?;

        let booking = self.repository.cancel(booking_id).await?;

        if let Err(err) = self.inventory.release(booking_id, existing.user_id).await {
            warn!(%err, %booking_id, "failed to release inventory after cancel");
        }

        self.publish(BookingEvent::Cancelled {
            booking_id: booking.id,
            zone_id: booking.zone_id,
            quantity: booking.quantity,
        })
        .await;

        Ok(booking)
    }

    /// Fetch a booking, checking ownership.
    ///
    /// # Errors
    /// Returns [`ReservationServiceError::NotOwner`] if `user_id` does not
    /// own the booking, or [`ReservationServiceError::NotFound`] otherwise.
    pub async fn get_booking(
        &self,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<Booking, ReservationServiceError> {
        let booking = self.repository.get_by_id(booking_id).await?;
        if booking.user_id != user_id {
            return Err(ReservationServiceError::NotOwner);
        }
        Ok(booking)
    }

    /// List a user's bookings, newest first.
    ///
    /// # Errors
    /// Returns `Internal` on a database failure.
    pub async fn get_user_bookings(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, ReservationServiceError> {
        Ok(self.repository.get_by_user_id(user_id, limit, offset).await?)
    }

    /// List a user's still-pending (`Reserved`) bookings.
    ///
    /// # Errors
    /// Returns `Internal` on a database failure.
    pub async fn get_pending_bookings(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<Booking>, ReservationServiceError> {
        Ok(self.repository.get_pending_by_user(user_id, limit).await?)
    }

    /// Per-status ticket counts for a user within an event.
    ///
    /// # Errors
    /// Returns `Internal` on a database failure.
    pub async fn get_summary(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<BookingSummary, ReservationServiceError> {
        Ok(self.repository.get_summary(user_id, event_id).await?)
    }

    /// List reservations whose hold has passed `expires_at` and are still
    /// `Reserved`, for the expiration worker's scan loop.
    ///
    /// # Errors
    /// Returns `Internal` on a database failure.
    pub async fn get_expired_reservations(
        &self,
        limit: i64,
    ) -> Result<Vec<Booking>, ReservationServiceError> {
        Ok(self.repository.get_expired_reservations(limit).await?)
    }

    /// Reclaim one expired reservation: releases inventory and marks the
    /// row `Expired`. Safe to call more than once for the same booking.
    ///
    /// # Errors
    /// Returns `Internal` on a database or Redis failure.
    pub async fn expire(&self, booking_id: BookingId) -> Result<Booking, ReservationServiceError> {
        let existing = self.repository.get_by_id(booking_id).await?;
        // The `BookingExpired` outbox row commits atomically with this
        // transition, so the reconciliation worker's feed never loses or
        // duplicates it; `publish` is not used here, unlike the other
        // transitions, since the outbox relay owns delivery for this one.
        let booking = self.repository.mark_expired_with_outbox(booking_id).await?;

        if existing.status != booking.status || existing.status.is_terminal() {
            // Already reclaimed by a previous call; inventory was released then.
            return Ok(booking);
        }

        if let Err(err) = self.inventory.release(booking_id, existing.user_id).await {
            warn!(%err, %booking_id, "failed to release inventory while expiring booking");
        }

        Ok(booking)
    }

    async fn publish(&self, event: BookingEvent) {
        let serialized = match SerializedEvent::from_event(&event, None) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(%err, "failed to serialize booking event");
                return;
            }
        };

        if let Err(err) = self.bus.publish(BOOKING_EVENTS, &serialized).await {
            error!(%err, "failed to publish booking event");
        }
    }
}

/// Generate a short, human-readable confirmation code: 4 random bytes, hex.
fn generate_confirmation_code() -> String {
    let mut bytes = [0_u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ais_insufficient_inventory_maps_to_service_error() {
        let err: ReservationServiceError = AisError::InsufficientInventory {
            requested: 3,
            available: 1,
        }
        .into();
        assert!(matches!(err, ReservationServiceError::InsufficientInventory));
    }

    #[test]
    fn repository_not_found_maps_to_service_error() {
        let err: ReservationServiceError =
            ReservationRepositoryError::NotFound(BookingId::new()).into();
        assert!(matches!(err, ReservationServiceError::NotFound));
    }

    #[test]
    fn repository_duplicate_key_maps_to_duplicate_request() {
        let err: ReservationServiceError =
            ReservationRepositoryError::DuplicateIdempotencyKey.into();
        assert!(matches!(err, ReservationServiceError::DuplicateRequest));
    }
}
