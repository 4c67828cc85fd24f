//! Step workers for the saga steps this process can execute directly:
//! confirming a booking, releasing inventory, and notifying the user.
//!
//! `charge_payment` and `refund_payment` are deliberately absent — those
//! belong to the external payment gateway integration, which acknowledges
//! on [`SAGA_EVENTS_SUCCESS`]/[`SAGA_EVENTS_FAILURE`] itself.

use std::sync::Arc;
use std::time::Duration;

use composable_rust_core::event::{Event as _, SerializedEvent};
use composable_rust_core::event_bus::EventBus;
use composable_rust_runtime::retry::{retry_with_backoff, RetryPolicy};
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::bus::{
    saga_command_topic, SagaMessage, UserNotification, SAGA_DLQ, SAGA_EVENTS_FAILURE,
    SAGA_EVENTS_SUCCESS, USER_NOTIFICATIONS,
};
use crate::reservation_service::ReservationService;

/// Errors from the single fallible step inside notifying a user: serializing
/// the notification or publishing it to the bus.
#[derive(Debug, thiserror::Error)]
enum NotifyError {
    #[error("failed to serialize notification: {0}")]
    Serialize(#[from] composable_rust_core::event::EventError),
    #[error("failed to publish notification: {0}")]
    Publish(#[from] composable_rust_core::event_bus::EventBusError),
}

/// One attempt is the first try; the rest are retries, so an attempts count
/// of zero or one both mean "never retry".
fn retry_policy_for(max_step_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_step_attempts.saturating_sub(1) as usize)
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(5))
        .multiplier(2.0)
        .build()
}

/// Executes the in-process saga steps and acknowledges their outcome.
pub struct SagaStepWorkers {
    service: Arc<ReservationService>,
    event_bus: Arc<dyn EventBus>,
    retry_policy: RetryPolicy,
}

impl SagaStepWorkers {
    /// Build the step worker pool over a reservation service and bus handle.
    ///
    /// `max_step_attempts` bounds how many times a failing `confirm_booking`
    /// or `release_inventory` step is retried (with exponential backoff)
    /// before it is acknowledged as a failure, handing the saga over to
    /// compensation.
    #[must_use]
    pub fn new(
        service: Arc<ReservationService>,
        event_bus: Arc<dyn EventBus>,
        max_step_attempts: u32,
    ) -> Self {
        Self {
            service,
            event_bus,
            retry_policy: retry_policy_for(max_step_attempts),
        }
    }

    /// Subscribe to the `confirm_booking`, `release_inventory`, and
    /// `notify_user` command topics and process them until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let confirm_topic = saga_command_topic("confirm_booking");
        let release_topic = saga_command_topic("release_inventory");
        let notify_topic = saga_command_topic("notify_user");
        let topics = [
            confirm_topic.as_str(),
            release_topic.as_str(),
            notify_topic.as_str(),
        ];

        let mut stream = match self.event_bus.subscribe(&topics).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, "saga step workers failed to subscribe to command topics");
                return;
            }
        };

        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(serialized)) => self.handle(&serialized).await,
                        Some(Err(err)) => warn!(%err, "saga command stream error"),
                        None => {
                            warn!("saga command stream ended, reconnecting");
                            match self.event_bus.subscribe(&topics).await {
                                Ok(new_stream) => stream = new_stream,
                                Err(err) => {
                                    error!(%err, "failed to resubscribe to saga command topics");
                                    return;
                                }
                            }
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn handle(&self, serialized: &SerializedEvent) {
        let message = match SagaMessage::from_bytes(&serialized.data) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "failed to decode saga command");
                return;
            }
        };

        match message {
            SagaMessage::ConfirmBooking {
                saga_id,
                booking_id,
                payment_id,
            } => {
                let outcome = retry_with_backoff(self.retry_policy.clone(), || {
                    self.service.confirm_internal(booking_id, payment_id)
                })
                .await;
                self.acknowledge(saga_id, "confirm_booking", outcome.is_ok(), outcome.err())
                    .await;
            }
            SagaMessage::ReleaseInventory {
                saga_id, booking_id, ..
            } => {
                let outcome = retry_with_backoff(self.retry_policy.clone(), || {
                    self.service.cancel_internal(booking_id)
                })
                .await;
                self.acknowledge(saga_id, "release_inventory", outcome.is_ok(), outcome.err())
                    .await;
            }
            SagaMessage::NotifyUser {
                saga_id,
                booking_id,
                user_id,
                succeeded,
            } => {
                let notification = UserNotification {
                    booking_id,
                    user_id,
                    booking_succeeded: succeeded,
                };
                let outcome = retry_with_backoff(self.retry_policy.clone(), || {
                    let notification = notification.clone();
                    async move {
                        let serialized = SerializedEvent::from_event(&notification, None)?;
                        self.event_bus
                            .publish(USER_NOTIFICATIONS, &serialized)
                            .await
                            .map_err(NotifyError::from)
                    }
                })
                .await;

                if let Err(err) = outcome {
                    warn!(%err, %saga_id, %booking_id, "send-notification exhausted retries, parking to dead letter queue");
                    self.dead_letter(saga_id, "notify_user", &err).await;
                }

                // send-notification is non-critical: its failure never blocks
                // the saga, so it is always acknowledged as succeeded.
                self.acknowledge(saga_id, "notify_user", true, None).await;
            }
            SagaMessage::ChargePayment { .. }
            | SagaMessage::RefundPayment { .. }
            | SagaMessage::StepAcknowledged { .. } => {}
        }
    }

    async fn dead_letter(&self, saga_id: crate::types::SagaId, step: &str, err: &NotifyError) {
        let ack = SagaMessage::StepAcknowledged {
            saga_id,
            step: step.to_string(),
            succeeded: false,
            detail: Some(err.to_string()),
        };
        let Ok(serialized) = SerializedEvent::from_event(&ack, None) else {
            error!(%saga_id, step, "failed to serialize dead-lettered step failure");
            return;
        };
        if let Err(err) = self.event_bus.publish(SAGA_DLQ, &serialized).await {
            error!(%err, %saga_id, step, "failed to publish to dead letter queue");
        }
    }

    async fn acknowledge(
        &self,
        saga_id: crate::types::SagaId,
        step: &str,
        succeeded: bool,
        err: Option<impl std::fmt::Display>,
    ) {
        let ack = SagaMessage::StepAcknowledged {
            saga_id,
            step: step.to_string(),
            succeeded,
            detail: err.map(|e| e.to_string()),
        };

        let serialized = match SerializedEvent::from_event(&ack, None) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(%err, %saga_id, step, "failed to serialize step acknowledgement");
                return;
            }
        };

        let topic = if succeeded {
            SAGA_EVENTS_SUCCESS
        } else {
            SAGA_EVENTS_FAILURE
        };
        if let Err(err) = self.event_bus.publish(topic, &serialized).await {
            error!(%err, %saga_id, step, "failed to publish step acknowledgement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_step_attempts_of_three_allows_two_retries() {
        assert_eq!(retry_policy_for(3).max_retries, 2);
    }

    #[test]
    fn max_step_attempts_of_one_allows_no_retries() {
        assert_eq!(retry_policy_for(1).max_retries, 0);
    }

    #[test]
    fn max_step_attempts_of_zero_is_treated_as_no_retries() {
        assert_eq!(retry_policy_for(0).max_retries, 0);
    }
}
