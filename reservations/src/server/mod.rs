//! HTTP surface: queue admission, booking lifecycle, and health.

pub mod error;
mod extractors;
mod handlers;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::queue::QueueAdmissionController;
use crate::reservation_service::ReservationService;
use crate::saga::SagaOrchestrator;

/// Shared dependencies every handler closes over.
#[derive(Clone)]
pub struct AppState {
    /// Reservation Service.
    pub reservations: Arc<ReservationService>,
    /// Queue Admission Controller.
    pub queue: Arc<QueueAdmissionController>,
    /// Saga orchestrator, started once a reservation succeeds.
    pub saga: Arc<SagaOrchestrator>,
    /// Durable pool, probed directly by `/healthz`.
    pub pg_pool: PgPool,
    /// Redis handle, probed directly by `/healthz`.
    pub redis: ConnectionManager,
}

/// Build the full router over a constructed [`AppState`].
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/queue/join", post(handlers::join_queue))
        .route("/queue/position/:event_id", get(handlers::queue_position))
        .route("/queue/leave", delete(handlers::leave_queue))
        .route("/bookings/reserve", post(handlers::reserve))
        .route("/bookings/:id/confirm", post(handlers::confirm))
        .route("/bookings/:id/cancel", post(handlers::cancel))
        .route("/bookings/:id", delete(handlers::cancel))
        .route("/bookings/:id", get(handlers::get_booking))
        .route("/bookings", get(handlers::list_bookings))
        .route("/bookings/pending", get(handlers::pending_bookings))
        .route("/bookings/summary", get(handlers::summary))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
