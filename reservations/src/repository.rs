//! Reservation Repository: the durable record of bookings in Postgres.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Booking, BookingId, BookingStatus, BookingSummary, EventId, Money, PaymentId, ShowId, UserId,
    ZoneId,
};

/// Errors surfaced by the Reservation Repository.
#[derive(Debug, Error)]
pub enum ReservationRepositoryError {
    /// The underlying database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// No booking exists for the given identifier.
    #[error("booking {0} not found")]
    NotFound(BookingId),
    /// A booking already exists for the given idempotency key.
    #[error("idempotency key already used")]
    DuplicateIdempotencyKey,
    /// The caller attempted to transition a booking out of a terminal status.
    #[error("booking {0} is already in a terminal status ({1})")]
    AlreadyTerminal(BookingId, BookingStatus),
}

/// Fields required to create a new reservation row.
#[derive(Debug, Clone)]
pub struct NewBooking {
    /// Identifier already minted by the Atomic Inventory Store at reserve
    /// time, so the durable row and the AIS reservation record share one id.
    pub id: BookingId,
    /// Owning user.
    pub user_id: UserId,
    /// Event booked.
    pub event_id: EventId,
    /// Specific show.
    pub show_id: ShowId,
    /// Seat zone.
    pub zone_id: ZoneId,
    /// Ticket count.
    pub quantity: u32,
    /// Price per ticket.
    pub unit_price: Money,
    /// Currency code.
    pub currency: String,
    /// Client-supplied dedup key.
    pub idempotency_key: Option<String>,
    /// Reservation hold deadline.
    pub expires_at: DateTime<Utc>,
}

/// Postgres-backed implementation of the Reservation Repository.
#[derive(Clone)]
pub struct ReservationRepository {
    pool: PgPool,
}

impl ReservationRepository {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new `Reserved` booking.
    ///
    /// # Errors
    /// Returns [`ReservationRepositoryError::DuplicateIdempotencyKey`] if the
    /// idempotency key is already in use, or a database error otherwise.
    pub async fn create(&self, new: NewBooking) -> Result<Booking, ReservationRepositoryError> {
        let id = new.id;
        let now = Utc::now();
        let total_price = new.unit_price.times(new.quantity);

        let row = sqlx::query(
            r"
            INSERT INTO bookings (
                id, user_id, event_id, show_id, zone_id, quantity,
                unit_price, total_price, currency, status, idempotency_key,
                reserved_at, expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'reserved', $10, $11, $12, $11, $11)
            RETURNING
                id, user_id, event_id, show_id, zone_id, quantity, unit_price,
                total_price, currency, status, idempotency_key, reserved_at,
                expires_at, confirmed_at, cancelled_at, payment_id,
                confirmation_code, created_at, updated_at
            ",
        )
        .bind(id.as_uuid())
        .bind(new.user_id.as_uuid())
        .bind(new.event_id.as_uuid())
        .bind(new.show_id.as_uuid())
        .bind(new.zone_id.as_uuid())
        .bind(i64::from(new.quantity))
        .bind(new.unit_price.0)
        .bind(total_price.0)
        .bind(&new.currency)
        .bind(&new.idempotency_key)
        .bind(now)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                ReservationRepositoryError::DuplicateIdempotencyKey
            }
            other => ReservationRepositoryError::Database(other),
        })?;

        Ok(row_to_booking(&row))
    }

    /// Fetch a booking by id.
    ///
    /// # Errors
    /// Returns [`ReservationRepositoryError::NotFound`] if no such booking
    /// exists, or a database error otherwise.
    pub async fn get_by_id(&self, id: BookingId) -> Result<Booking, ReservationRepositoryError> {
        let row = sqlx::query(select_all().as_str())
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ReservationRepositoryError::NotFound(id))?;
        Ok(row_to_booking(&row))
    }

    /// Fetch a booking by its client-supplied idempotency key, if any.
    ///
    /// # Errors
    /// Returns a database error on query failure.
    pub async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Booking>, ReservationRepositoryError> {
        let row = sqlx::query(
            format!(
                "{} WHERE idempotency_key = $1",
                select_all_unfiltered()
            )
            .as_str(),
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_booking))
    }

    /// List a user's bookings, newest first, paginated.
    ///
    /// # Errors
    /// Returns a database error on query failure.
    pub async fn get_by_user_id(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, ReservationRepositoryError> {
        let rows = sqlx::query(
            format!(
                "{} WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                select_all_unfiltered()
            )
            .as_str(),
        )
        .bind(user_id.as_uuid())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_booking).collect())
    }

    /// Count a user's live (reserved or confirmed) tickets for an event,
    /// used to enforce the per-user ticket cap.
    ///
    /// # Errors
    /// Returns a database error on query failure.
    pub async fn count_live_tickets_by_user_and_event(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<u32, ReservationRepositoryError> {
        let row = sqlx::query(
            r"
            SELECT COALESCE(SUM(quantity), 0) AS total
            FROM bookings
            WHERE user_id = $1 AND event_id = $2 AND status IN ('reserved', 'confirmed')
            ",
        )
        .bind(user_id.as_uuid())
        .bind(event_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    /// Transition a booking to `Confirmed`.
    ///
    /// # Errors
    /// Returns [`ReservationRepositoryError::AlreadyTerminal`] if the
    /// booking is not currently `Reserved`, [`ReservationRepositoryError::NotFound`]
    /// if it doesn't exist, or a database error otherwise.
    pub async fn confirm(
        &self,
        id: BookingId,
        payment_id: PaymentId,
        confirmation_code: &str,
    ) -> Result<Booking, ReservationRepositoryError> {
        self.transition_from_reserved(
            id,
            "confirmed",
            "confirmed_at",
            Some((payment_id, confirmation_code)),
        )
        .await
    }

    /// Transition a booking to `Cancelled`.
    ///
    /// # Errors
    /// Returns [`ReservationRepositoryError::AlreadyTerminal`] if the
    /// booking is not currently `Reserved`, [`ReservationRepositoryError::NotFound`]
    /// if it doesn't exist, or a database error otherwise.
    pub async fn cancel(&self, id: BookingId) -> Result<Booking, ReservationRepositoryError> {
        self.transition_from_reserved(id, "cancelled", "cancelled_at", None)
            .await
    }

    /// Mark a booking `Expired`. Idempotent: re-expiring an already-expired
    /// booking returns the existing row rather than erroring, since both
    /// the scan loop and a retried bus message may race to expire the same
    /// booking.
    ///
    /// # Errors
    /// Returns [`ReservationRepositoryError::NotFound`] if no such booking
    /// exists, or a database error otherwise.
    pub async fn mark_expired(&self, id: BookingId) -> Result<Booking, ReservationRepositoryError> {
        let existing = self.get_by_id(id).await?;
        if existing.status == BookingStatus::Expired {
            return Ok(existing);
        }
        if existing.status.is_terminal() {
            return Err(ReservationRepositoryError::AlreadyTerminal(
                id,
                existing.status,
            ));
        }

        let row = sqlx::query(
            format!(
                "UPDATE bookings SET status = 'expired', updated_at = $2 WHERE id = $1 AND status = 'reserved' RETURNING {}",
                select_columns()
            )
            .as_str(),
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ReservationRepositoryError::NotFound(id))?;

        Ok(row_to_booking(&row))
    }

    /// Mark a booking `Expired` and record a `booking_outbox` row for its
    /// `BookingExpired` event in the same transaction, so the expiration
    /// worker's feed to the reconciliation worker can never lose or
    /// duplicate a transition: either both the state change and the
    /// outbox row commit, or neither does. Idempotent like [`Self::mark_expired`].
    ///
    /// # Errors
    /// Returns [`ReservationRepositoryError::AlreadyTerminal`] if the
    /// booking is terminal in a status other than `Expired`,
    /// [`ReservationRepositoryError::NotFound`] if it doesn't exist, or a
    /// database error otherwise.
    pub async fn mark_expired_with_outbox(
        &self,
        id: BookingId,
    ) -> Result<Booking, ReservationRepositoryError> {
        let mut tx = self.pool.begin().await?;

        let existing_row = sqlx::query(select_all().as_str())
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ReservationRepositoryError::NotFound(id))?;
        let existing = row_to_booking(&existing_row);

        if existing.status == BookingStatus::Expired {
            tx.commit().await?;
            return Ok(existing);
        }
        if existing.status.is_terminal() {
            return Err(ReservationRepositoryError::AlreadyTerminal(
                id,
                existing.status,
            ));
        }

        let row = sqlx::query(
            format!(
                "UPDATE bookings SET status = 'expired', updated_at = $2 WHERE id = $1 AND status = 'reserved' RETURNING {}",
                select_columns()
            )
            .as_str(),
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ReservationRepositoryError::NotFound(id))?;
        let booking = row_to_booking(&row);

        let payload = serde_json::json!({
            "booking_id": booking.id.as_uuid(),
            "event_id": booking.event_id.as_uuid(),
            "zone_id": booking.zone_id.as_uuid(),
            "quantity": booking.quantity,
        });
        sqlx::query(
            "INSERT INTO booking_outbox (booking_id, event_type, payload) VALUES ($1, $2, $3)",
        )
        .bind(booking.id.as_uuid())
        .bind("booking.expired")
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(booking)
    }

    /// List bookings past their `expires_at` that are still `Reserved`,
    /// oldest first, capped at `limit` rows per call.
    ///
    /// # Errors
    /// Returns a database error on query failure.
    pub async fn get_expired_reservations(
        &self,
        limit: i64,
    ) -> Result<Vec<Booking>, ReservationRepositoryError> {
        let rows = sqlx::query(
            format!(
                "{} WHERE status = 'reserved' AND expires_at <= $1 ORDER BY expires_at ASC LIMIT $2",
                select_all_unfiltered()
            )
            .as_str(),
        )
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_booking).collect())
    }

    /// List a user's still-`Reserved` bookings, oldest first.
    ///
    /// # Errors
    /// Returns a database error on query failure.
    pub async fn get_pending_by_user(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<Booking>, ReservationRepositoryError> {
        let rows = sqlx::query(
            format!(
                "{} WHERE user_id = $1 AND status = 'reserved' ORDER BY reserved_at ASC LIMIT $2",
                select_all_unfiltered()
            )
            .as_str(),
        )
        .bind(user_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_booking).collect())
    }

    /// Per-status ticket counts for one user within one event.
    ///
    /// # Errors
    /// Returns a database error on query failure.
    pub async fn get_summary(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<BookingSummary, ReservationRepositoryError> {
        let row = sqlx::query(
            r"
            SELECT
                COALESCE(SUM(quantity) FILTER (WHERE status = 'reserved'), 0) AS reserved,
                COALESCE(SUM(quantity) FILTER (WHERE status = 'confirmed'), 0) AS confirmed,
                COALESCE(SUM(quantity) FILTER (WHERE status = 'cancelled'), 0) AS cancelled,
                COALESCE(SUM(quantity) FILTER (WHERE status = 'expired'), 0) AS expired
            FROM bookings
            WHERE user_id = $1 AND event_id = $2
            ",
        )
        .bind(user_id.as_uuid())
        .bind(event_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        let as_u32 = |column: &str| -> Result<u32, ReservationRepositoryError> {
            let value: i64 = row.try_get(column)?;
            Ok(u32::try_from(value).unwrap_or(u32::MAX))
        };

        Ok(BookingSummary {
            event_id,
            reserved: as_u32("reserved")?,
            confirmed: as_u32("confirmed")?,
            cancelled: as_u32("cancelled")?,
            expired: as_u32("expired")?,
        })
    }

    async fn transition_from_reserved(
        &self,
        id: BookingId,
        new_status: &str,
        timestamp_column: &str,
        confirm_fields: Option<(PaymentId, &str)>,
    ) -> Result<Booking, ReservationRepositoryError> {
        let now = Utc::now();
        let row = if let Some((payment_id, confirmation_code)) = confirm_fields {
            sqlx::query(
                format!(
                    "UPDATE bookings SET status = '{new_status}', {timestamp_column} = $2, payment_id = $3, confirmation_code = $4, updated_at = $2 WHERE id = $1 AND status = 'reserved' RETURNING {}",
                    select_columns()
                )
                .as_str(),
            )
            .bind(id.as_uuid())
            .bind(now)
            .bind(payment_id.as_uuid())
            .bind(confirmation_code)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                format!(
                    "UPDATE bookings SET status = '{new_status}', {timestamp_column} = $2, updated_at = $2 WHERE id = $1 AND status = 'reserved' RETURNING {}",
                    select_columns()
                )
                .as_str(),
            )
            .bind(id.as_uuid())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
        };

        if let Some(row) = row {
            return Ok(row_to_booking(&row));
        }

        // The conditional UPDATE matched nothing: either the booking never
        // existed, or a concurrent transition already moved it out of
        // Reserved between our two queries. get_by_id disambiguates —
        // NotFound propagates via `?` if the row is genuinely missing.
        let existing = self.get_by_id(id).await?;
        Err(ReservationRepositoryError::AlreadyTerminal(
            id,
            existing.status,
        ))
    }
}

fn select_columns() -> &'static str {
    "id, user_id, event_id, show_id, zone_id, quantity, unit_price, total_price, \
     currency, status, idempotency_key, reserved_at, expires_at, confirmed_at, \
     cancelled_at, payment_id, confirmation_code, created_at, updated_at"
}

fn select_all() -> String {
    format!("SELECT {} FROM bookings WHERE id = $1", select_columns())
}

fn select_all_unfiltered() -> String {
    format!("SELECT {} FROM bookings", select_columns())
}

fn row_to_booking(row: &sqlx::postgres::PgRow) -> Booking {
    let quantity: i64 = row.get("quantity");
    Booking {
        id: BookingId(row.get::<Uuid, _>("id")),
        user_id: UserId(row.get::<Uuid, _>("user_id")),
        event_id: EventId(row.get::<Uuid, _>("event_id")),
        show_id: ShowId(row.get::<Uuid, _>("show_id")),
        zone_id: ZoneId(row.get::<Uuid, _>("zone_id")),
        quantity: u32::try_from(quantity).unwrap_or(0),
        unit_price: Money(row.get("unit_price")),
        total_price: Money(row.get("total_price")),
        currency: row.get("currency"),
        status: parse_status(row.get("status")),
        idempotency_key: row.get("idempotency_key"),
        reserved_at: row.get("reserved_at"),
        expires_at: row.get("expires_at"),
        confirmed_at: row.get("confirmed_at"),
        cancelled_at: row.get("cancelled_at"),
        payment_id: row
            .get::<Option<Uuid>, _>("payment_id")
            .map(PaymentId),
        confirmation_code: row.get("confirmation_code"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_status(raw: String) -> BookingStatus {
    match raw.as_str() {
        "confirmed" => BookingStatus::Confirmed,
        "cancelled" => BookingStatus::Cancelled,
        "expired" => BookingStatus::Expired,
        _ => BookingStatus::Reserved,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_defaults_to_reserved_for_unknown_values() {
        assert_eq!(parse_status("reserved".to_string()), BookingStatus::Reserved);
        assert_eq!(parse_status("confirmed".to_string()), BookingStatus::Confirmed);
        assert_eq!(parse_status("garbage".to_string()), BookingStatus::Reserved);
    }

    #[test]
    fn select_columns_includes_every_booking_field() {
        for field in [
            "id",
            "payment_id",
            "confirmation_code",
            "idempotency_key",
            "expires_at",
        ] {
            assert!(select_columns().contains(field));
        }
    }
}
