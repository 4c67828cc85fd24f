//! Ticket reservation and booking saga service.
//!
//! Coordinates an Atomic Inventory Store (Redis), a durable Reservation
//! Repository (Postgres), a Queue Admission Controller for pre-sale
//! throttling, and a booking confirmation saga that charges payment,
//! confirms the booking, and compensates on failure.

pub mod bus;
pub mod config;
pub mod expiration_worker;
pub mod inventory;
pub mod jwt;
pub mod outbox;
pub mod queue;
pub mod reconciliation;
pub mod repository;
pub mod reservation_service;
pub mod saga;
pub mod server;
pub mod types;
