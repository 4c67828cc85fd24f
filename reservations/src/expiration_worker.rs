//! Expiration Worker: periodically reclaims reservations whose hold expired
//! without a confirmation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::reservation_service::{ReservationService, ReservationServiceError};

/// Scans the Reservation Repository for timed-out holds and reclaims them.
pub struct ExpirationWorker {
    service: Arc<ReservationService>,
    scan_interval: Duration,
    scan_batch_size: i64,
}

impl ExpirationWorker {
    /// Construct a worker over a shared [`ReservationService`].
    #[must_use]
    pub const fn new(
        service: Arc<ReservationService>,
        scan_interval: Duration,
        scan_batch_size: u32,
    ) -> Self {
        Self {
            service,
            scan_interval,
            scan_batch_size: scan_batch_size as i64,
        }
    }

    /// Run the scan loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scan_once().await {
                        Ok(reclaimed) if reclaimed > 0 => {
                            info!(reclaimed, "reclaimed expired reservations");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "expiration scan tick failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("expiration worker shutting down");
                    break;
                }
            }
        }
    }

    /// Run a single scan-and-reclaim pass, returning the number reclaimed.
    ///
    /// Individual reclaim failures are logged and skipped rather than
    /// aborting the whole batch, so one bad row never blocks the rest.
    ///
    /// # Errors
    /// Returns an error if listing expired reservations itself fails.
    pub async fn scan_once(&self) -> Result<usize, ReservationServiceError> {
        let expired = self
            .service
            .get_expired_reservations(self.scan_batch_size)
            .await?;

        let mut reclaimed = 0;
        for booking in expired {
            match self.service.expire(booking.id).await {
                Ok(_) => reclaimed += 1,
                Err(err) => warn!(%err, booking_id = %booking.id, "failed to reclaim expired booking"),
            }
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    // Exercising `run`/`scan_once` requires a live Postgres + Redis backed
    // `ReservationService`; see `tests/scenarios.rs`.
}
