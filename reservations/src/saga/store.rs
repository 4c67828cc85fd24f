//! Durable persistence for saga instances.
//!
//! A [`SagaInstanceState`](super::SagaInstanceState) snapshot is a relational
//! row, not an event-sourced aggregate: every transition overwrites the row
//! in place, and the JSON payload is a point-in-time snapshot used to
//! recover in-flight sagas after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

use crate::types::{BookingId, SagaId};

/// Errors surfaced while persisting saga instances.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// The underlying database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The stored payload could not be deserialized.
    #[error("corrupt saga snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A persisted saga row.
#[derive(Debug, Clone)]
pub struct SagaRow {
    /// Saga identifier.
    pub id: SagaId,
    /// Booking this saga is driving to completion.
    pub booking_id: BookingId,
    /// Coarse status string, e.g. `"running"`, `"compensated"`.
    pub status: String,
    /// Full state snapshot, serialized as JSON.
    pub payload: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Postgres-backed saga instance store.
#[derive(Clone)]
pub struct SagaStore {
    pool: PgPool,
}

impl SagaStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite a saga's snapshot.
    ///
    /// # Errors
    /// Returns an error if serialization or the upsert query fails.
    pub async fn save<T: Serialize>(
        &self,
        saga_id: SagaId,
        booking_id: BookingId,
        status: &str,
        state: &T,
    ) -> Result<(), SagaStoreError> {
        let payload = serde_json::to_value(state)?;
        let now = Utc::now();

        sqlx::query(
            r"
            INSERT INTO saga_instances (id, booking_id, status, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(saga_id.as_uuid())
        .bind(booking_id.as_uuid())
        .bind(status)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load every saga row not yet in a terminal status, used to rebuild
    /// in-memory orchestrator state after a restart.
    ///
    /// # Errors
    /// Returns an error on a database failure.
    pub async fn load_in_flight(&self) -> Result<Vec<SagaRow>, SagaStoreError> {
        let rows = sqlx::query_as::<_, (uuid::Uuid, uuid::Uuid, String, serde_json::Value, DateTime<Utc>, DateTime<Utc>)>(
            r"
            SELECT id, booking_id, status, payload, created_at, updated_at
            FROM saga_instances
            WHERE status NOT IN ('completed', 'compensated', 'stuck')
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, booking_id, status, payload, created_at, updated_at)| SagaRow {
                id: SagaId(id),
                booking_id: BookingId(booking_id),
                status,
                payload,
                created_at,
                updated_at,
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn saga_row_carries_its_identifiers() {
        let row = SagaRow {
            id: SagaId::new(),
            booking_id: BookingId::new(),
            status: "running".to_string(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(row.status, "running");
    }
}
