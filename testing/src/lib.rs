//! # Composable Rust Testing
//!
//! Testing utilities and helpers for the Composable Rust architecture.
//!
//! This crate provides:
//! - Mock implementations of Environment traits
//! - Test helpers and builders
//! - Property-based testing utilities
//! - Assertion helpers for reducers and stores
//!
//! ## Example
//!
//! ```ignore
//! use composable_rust_testing::test_clock;
//! use composable_rust_runtime::Store;
//!
//! #[tokio::test]
//! async fn test_order_flow() {
//!     let env = test_environment();
//!     let store = OrderStore::new(OrderState::default(), OrderReducer, env);
//!
//!     store.send(OrderAction::PlaceOrder {
//!         customer_id: CustomerId::new(1),
//!         items: vec![],
//!     }).await;
//!
//!     let state = store.state(|s| s.clone()).await;
//!     assert_eq!(state.orders.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use composable_rust_core::environment::Clock;

/// Mock implementations of Environment traits
///
/// # Phase 1 Implementation
///
/// This module will contain:
/// - `MockDatabase`: In-memory event store
/// - `FixedClock`: Deterministic time
/// - `MockEventPublisher`: Captures published events
/// - `MockHttpClient`: Stubbed HTTP responses
/// - `SequentialIdGenerator`: Predictable IDs
///
/// Mock implementations for testing.
#[allow(clippy::unwrap_used)] // test infrastructure uses unwrap for simplicity
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use composable_rust_core::event::SerializedEvent;
    use composable_rust_core::event_bus::{EventBus, EventBusError, EventStream};
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    /// In-process, fire-and-forget event bus for fast, deterministic tests.
    ///
    /// A topic with no subscribers simply drops its events, the same as a
    /// slow/absent consumer does against the production Redpanda-backed bus.
    #[derive(Clone)]
    pub struct InMemoryEventBus {
        topics: Arc<Mutex<HashMap<String, broadcast::Sender<SerializedEvent>>>>,
    }

    impl InMemoryEventBus {
        /// Create a new, empty bus.
        #[must_use]
        pub fn new() -> Self {
            Self {
                topics: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn sender_for(&self, topic: &str) -> broadcast::Sender<SerializedEvent> {
            let mut topics = self.topics.lock().unwrap();
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(1024).0)
                .clone()
        }
    }

    impl Default for InMemoryEventBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EventBus for InMemoryEventBus {
        fn publish(
            &self,
            topic: &str,
            event: &SerializedEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
            let sender = self.sender_for(topic);
            let event = event.clone();
            Box::pin(async move {
                // No subscribers is not an error: fire-and-forget events are
                // allowed to have nobody listening yet.
                let _ = sender.send(event);
                Ok(())
            })
        }

        fn subscribe(
            &self,
            topics: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
            let receivers: Vec<broadcast::Receiver<SerializedEvent>> = topics
                .iter()
                .map(|topic| self.sender_for(topic).subscribe())
                .collect();

            Box::pin(async move {
                let (tx, rx) = tokio::sync::mpsc::channel(1024);

                for mut receiver in receivers {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        loop {
                            match receiver.recv().await {
                                Ok(event) => {
                                    if tx.send(Ok(event)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    });
                }

                let stream = async_stream::stream! {
                    let mut rx = rx;
                    while let Some(result) = rx.recv().await {
                        yield result;
                    }
                };

                Ok(Box::pin(stream) as EventStream)
            })
        }
    }

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use composable_rust_testing::mocks::FixedClock;
    /// use composable_rust_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use composable_rust_core::event::Event;
        use futures::StreamExt;

        #[derive(serde::Serialize)]
        struct Probe(u8);

        impl Event for Probe {
            fn event_type(&self) -> &'static str {
                "Probe.v1"
            }
        }

        #[tokio::test]
        async fn subscriber_receives_events_published_after_it_subscribes() {
            let bus = InMemoryEventBus::new();
            let mut stream = bus.subscribe(&["topic-a"]).await.unwrap();

            let event = SerializedEvent::from_event(&Probe(1), None).unwrap();
            bus.publish("topic-a", &event).await.unwrap();

            let received = stream.next().await.unwrap().unwrap();
            assert_eq!(received.event_type, "Probe.v1");
        }

        #[tokio::test]
        async fn publish_with_no_subscribers_is_not_an_error() {
            let bus = InMemoryEventBus::new();
            let event = SerializedEvent::from_event(&Probe(1), None).unwrap();
            bus.publish("nobody-listening", &event).await.unwrap();
        }

        #[tokio::test]
        async fn subscriber_only_sees_its_own_topics() {
            let bus = InMemoryEventBus::new();
            let mut stream = bus.subscribe(&["topic-a"]).await.unwrap();

            let other = SerializedEvent::from_event(&Probe(2), None).unwrap();
            bus.publish("topic-b", &other).await.unwrap();
            let mine = SerializedEvent::from_event(&Probe(1), None).unwrap();
            bus.publish("topic-a", &mine).await.unwrap();

            let received = stream.next().await.unwrap().unwrap();
            assert_eq!(received.data, mine.data);
        }
    }
}

/// Test helpers and utilities
///
/// # Phase 1 Implementation
///
/// This module will contain:
/// - Builder patterns for common test scenarios
/// - Assertion helpers
/// - Test data generators
///
/// Test helpers and utilities.
pub mod helpers {
    // Placeholder for test helpers
}

/// Property-based testing utilities
///
/// # Phase 1 Implementation
///
/// This module will contain:
/// - proptest Arbitrary implementations
/// - Custom strategies for domain types
/// - Property test helpers
///
/// Property-based testing utilities using proptest.
pub mod properties {
    // Placeholder for property test utilities
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};

// Placeholder test module
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }
}
