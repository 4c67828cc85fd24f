//! Bridges domain errors to HTTP responses.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::jwt::QueuePassJwtError;
use crate::queue::QueueError;
use crate::reservation_service::ReservationServiceError;
use crate::types::BookingStatus;

/// Error type returned by every HTTP handler, carrying the status/code pair
/// the edge maps onto exactly once.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: String,
}

impl AppError {
    #[must_use]
    const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
        }
    }

    /// 400 with a caller-facing message.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into(), "BAD_REQUEST".to_string())
    }

    /// 400, tagged with a specific validation-failure code.
    #[must_use]
    pub fn bad_request_coded(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into(), code.to_string())
    }

    /// 403 Forbidden, tagged with a specific queue-pass failure code.
    #[must_use]
    pub fn forbidden(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message.into(), code.to_string())
    }

    /// 404 Not Found, tagged with a specific resource code.
    #[must_use]
    pub fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message.into(), code.to_string())
    }

    /// 409 Conflict, tagged with a specific conflict code.
    #[must_use]
    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message.into(), code.to_string())
    }

    /// 410 Gone, for an expired reservation or queue pass.
    #[must_use]
    pub fn gone(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, message.into(), code.to_string())
    }

    /// 500, for failures the caller cannot recover from.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_ERROR".to_string(),
        )
    }

    /// The HTTP status this error renders as.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The machine-readable error code this error renders as.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, code = %self.code, message = %self.message, "request failed");
        }
        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ReservationServiceError> for AppError {
    fn from(err: ReservationServiceError) -> Self {
        match err {
            ReservationServiceError::InvalidQuantity => {
                Self::bad_request_coded("INVALID_QUANTITY", err.to_string())
            }
            ReservationServiceError::InsufficientInventory => {
                Self::conflict("INSUFFICIENT_SEATS", err.to_string())
            }
            ReservationServiceError::ZoneNotFound => Self::not_found("ZONE_NOT_FOUND", err.to_string()),
            ReservationServiceError::TicketCapExceeded { .. } => {
                Self::conflict("MAX_TICKETS_EXCEEDED", err.to_string())
            }
            ReservationServiceError::NotOwner => Self::forbidden("FORBIDDEN", err.to_string()),
            ReservationServiceError::AlreadyTerminal(BookingStatus::Expired) => {
                Self::gone("EXPIRED", err.to_string())
            }
            ReservationServiceError::AlreadyTerminal(BookingStatus::Confirmed) => {
                Self::conflict("ALREADY_CONFIRMED", err.to_string())
            }
            ReservationServiceError::AlreadyTerminal(
                BookingStatus::Cancelled | BookingStatus::Reserved,
            ) => Self::conflict("ALREADY_RELEASED", err.to_string()),
            ReservationServiceError::NotFound => Self::not_found("NOT_FOUND", err.to_string()),
            ReservationServiceError::DuplicateRequest => {
                Self::conflict("DUPLICATE_REQUEST", err.to_string())
            }
            ReservationServiceError::Internal(message) => Self::internal(message),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotQueued => Self::forbidden("QUEUE_PASS_REQUIRED", err.to_string()),
            QueueError::Jwt(QueuePassJwtError::Expired) => {
                Self::forbidden("QUEUE_PASS_EXPIRED", err.to_string())
            }
            QueueError::Jwt(_) => Self::forbidden("INVALID_QUEUE_PASS", err.to_string()),
            QueueError::AlreadyInQueue => Self::conflict("ALREADY_IN_QUEUE", err.to_string()),
            QueueError::QueueFull => Self::conflict("QUEUE_FULL", err.to_string()),
            QueueError::NotInQueue => Self::not_found("NOT_IN_QUEUE", err.to_string()),
            QueueError::InvalidToken => Self::forbidden("INVALID_TOKEN", err.to_string()),
            QueueError::Redis(_) => Self::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_inventory_maps_to_409_insufficient_seats() {
        let app_err: AppError = ReservationServiceError::InsufficientInventory.into();
        assert_eq!(app_err.status, StatusCode::CONFLICT);
        assert_eq!(app_err.code, "INSUFFICIENT_SEATS");
    }

    #[test]
    fn expired_booking_maps_to_410_gone() {
        let app_err: AppError = ReservationServiceError::AlreadyTerminal(BookingStatus::Expired).into();
        assert_eq!(app_err.status, StatusCode::GONE);
        assert_eq!(app_err.code, "EXPIRED");
    }

    #[test]
    fn confirmed_booking_maps_to_already_confirmed() {
        let app_err: AppError =
            ReservationServiceError::AlreadyTerminal(BookingStatus::Confirmed).into();
        assert_eq!(app_err.code, "ALREADY_CONFIRMED");
    }

    #[test]
    fn expired_queue_pass_is_distinguished_from_other_jwt_failures() {
        let app_err: AppError = QueueError::Jwt(QueuePassJwtError::Expired).into();
        assert_eq!(app_err.code, "QUEUE_PASS_EXPIRED");
    }
}
