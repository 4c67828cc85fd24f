//! Route handlers for the queue, booking, and health endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::error::AppError;
use super::extractors::AuthUser;
use super::AppState;
use crate::reservation_service::ReserveRequest;
use crate::types::{Booking, BookingId, BookingSummary, EventId, Money, PaymentId, ShowId, ZoneId};

#[derive(Debug, Deserialize)]
pub struct JoinQueueBody {
    event_id: EventId,
}

#[derive(Debug, Serialize)]
pub struct JoinQueueResponse {
    position: u64,
    token: String,
    estimated_wait: u64,
    joined_at: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct QueuePositionResponse {
    position: u64,
    total_in_queue: u64,
    estimated_wait: u64,
    is_ready: bool,
    queue_pass: Option<String>,
    queue_pass_expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn join_queue(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<JoinQueueBody>,
) -> Result<(axum::http::StatusCode, Json<JoinQueueResponse>), AppError> {
    let outcome = state.queue.join(body.event_id, user_id).await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(JoinQueueResponse {
            position: outcome.position,
            token: outcome.token,
            estimated_wait: outcome.estimated_wait_seconds,
            joined_at: outcome.joined_at,
            expires_at: outcome.expires_at,
        }),
    ))
}

pub async fn queue_position(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(event_id): Path<EventId>,
) -> Result<Json<QueuePositionResponse>, AppError> {
    let outcome = state.queue.get_position(event_id, user_id).await?;
    Ok(Json(QueuePositionResponse {
        position: outcome.position,
        total_in_queue: outcome.total_in_queue,
        estimated_wait: outcome.estimated_wait_seconds,
        is_ready: outcome.is_ready,
        queue_pass: outcome.queue_pass,
        queue_pass_expires_at: outcome.queue_pass_expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LeaveQueueBody {
    event_id: EventId,
    token: String,
}

pub async fn leave_queue(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<LeaveQueueBody>,
) -> Result<(), AppError> {
    state.queue.leave(body.event_id, user_id, &body.token).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ReserveBody {
    event_id: EventId,
    zone_id: ZoneId,
    show_id: ShowId,
    quantity: u32,
    unit_price: Option<i64>,
    currency: Option<String>,
    idempotency_key: Option<String>,
    queue_pass: String,
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    booking_id: BookingId,
    status: String,
    expires_at: chrono::DateTime<chrono::Utc>,
    total_price: i64,
}

pub async fn reserve(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<ReserveBody>,
) -> Result<(axum::http::StatusCode, Json<ReserveResponse>), AppError> {
    let claims = state.queue.redeem(&body.queue_pass).await?;
    if claims.user_id != user_id {
        return Err(AppError::forbidden(
            "QUEUE_PASS_MISMATCH",
            "queue pass was not issued to this user",
        ));
    }
    if claims.event_id != body.event_id {
        return Err(AppError::forbidden(
            "QUEUE_PASS_MISMATCH",
            "queue pass was not issued for this event",
        ));
    }

    let Some(unit_price) = body.unit_price else {
        return Err(AppError::bad_request("unit_price is required"));
    };

    let booking = state
        .reservations
        .reserve(ReserveRequest {
            user_id,
            event_id: body.event_id,
            show_id: body.show_id,
            zone_id: body.zone_id,
            quantity: body.quantity,
            unit_price: Money(unit_price),
            currency: body.currency.unwrap_or_else(|| "USD".to_string()),
            idempotency_key: body.idempotency_key,
        })
        .await?;

    state
        .saga
        .start(
            booking.id,
            booking.user_id,
            booking.event_id,
            booking.zone_id,
            booking.quantity,
            booking.total_price.0,
        )
        .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(ReserveResponse {
            booking_id: booking.id,
            status: booking.status.to_string(),
            expires_at: booking.expires_at,
            total_price: booking.total_price.0,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    payment_id: Option<PaymentId>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    booking_id: BookingId,
    status: String,
    confirmed_at: Option<chrono::DateTime<chrono::Utc>>,
    confirmation_code: Option<String>,
}

pub async fn confirm(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<BookingId>,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<ConfirmResponse>, AppError> {
    let payment_id = body.payment_id.unwrap_or_else(PaymentId::new);
    let booking = state.reservations.confirm(id, user_id, payment_id).await?;
    Ok(Json(ConfirmResponse {
        booking_id: booking.id,
        status: booking.status.to_string(),
        confirmed_at: booking.confirmed_at,
        confirmation_code: booking.confirmation_code,
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    booking_id: BookingId,
    status: String,
    message: String,
}

pub async fn cancel(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<BookingId>,
) -> Result<Json<CancelResponse>, AppError> {
    let booking = state.reservations.cancel(id, user_id).await?;
    Ok(Json(CancelResponse {
        booking_id: booking.id,
        status: booking.status.to_string(),
        message: "booking cancelled".to_string(),
    }))
}

pub async fn get_booking(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<BookingId>,
) -> Result<Json<Booking>, AppError> {
    let booking = state.reservations.get_booking(id, user_id).await?;
    Ok(Json(booking))
}

#[derive(Debug, Deserialize)]
pub struct ListBookingsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

const fn default_limit() -> i64 {
    20
}

pub async fn list_bookings(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<ListBookingsQuery>,
) -> Result<Json<Vec<Booking>>, AppError> {
    let bookings = state
        .reservations
        .get_user_bookings(user_id, query.limit, query.offset)
        .await?;
    Ok(Json(bookings))
}

#[derive(Debug, Deserialize)]
pub struct PendingBookingsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

pub async fn pending_bookings(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<PendingBookingsQuery>,
) -> Result<Json<Vec<Booking>>, AppError> {
    let bookings = state
        .reservations
        .get_pending_bookings(user_id, query.limit)
        .await?;
    Ok(Json(bookings))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    event_id: EventId,
}

pub async fn summary(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<BookingSummary>, AppError> {
    let summary = state.reservations.get_summary(user_id, query.event_id).await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    redis: &'static str,
    postgres: &'static str,
    bus: &'static str,
}

/// Pings Postgres and Redis directly; the bus has no side-effect-free probe
/// on its trait, so its field reports `"unknown"` rather than a guess.
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let postgres = match sqlx::query("SELECT 1").execute(&state.pg_pool).await {
        Ok(_) => "ok",
        Err(_) => "down",
    };

    let ping_result: Result<String, redis::RedisError> =
        redis::cmd("PING").query_async(&mut state.redis.clone()).await;
    let redis = if ping_result.is_ok() { "ok" } else { "down" };

    let status = if postgres == "ok" && redis == "ok" {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        redis,
        postgres,
        bus: "unknown",
    })
}
