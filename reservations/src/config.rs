//! Environment-driven configuration, one struct per subsystem.

use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::types::EventId;

/// Top-level configuration, assembled from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Durable storage (Reservation Repository, saga instances, outbox).
    pub postgres: PostgresConfig,
    /// Atomic Inventory Store + Queue Admission Controller backing store.
    pub redis: RedisConfig,
    /// Event bus topics and connection settings.
    pub redpanda: RedpandaConfig,
    /// HTTP surface.
    pub server: ServerConfig,
    /// Zone inventory defaults and reservation TTLs.
    pub inventory: InventoryConfig,
    /// Queue admission tuning.
    pub queue: QueueConfig,
    /// Saga step timeouts and retry policy.
    pub saga: SagaConfig,
    /// Expiration worker scan cadence.
    pub expiration: ExpirationConfig,
    /// Outbox relay poll cadence.
    pub outbox: OutboxConfig,
    /// Reconciliation worker scan cadence.
    pub reconciliation: ReconciliationConfig,
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// development-friendly defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            postgres: PostgresConfig::from_env(),
            redis: RedisConfig::from_env(),
            redpanda: RedpandaConfig::from_env(),
            server: ServerConfig::from_env(),
            inventory: InventoryConfig::from_env(),
            queue: QueueConfig::from_env(),
            saga: SagaConfig::from_env(),
            expiration: ExpirationConfig::from_env(),
            outbox: OutboxConfig::from_env(),
            reconciliation: ReconciliationConfig::from_env(),
        }
    }
}

/// Postgres connection settings for the Reservation Repository.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string.
    pub url: String,
    /// Maximum pool size.
    pub max_connections: u32,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl PostgresConfig {
    fn from_env() -> Self {
        Self {
            url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/reservations".to_string()),
            max_connections: env::var("POSTGRES_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),
            connect_timeout: Duration::from_secs(
                env::var("POSTGRES_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }
}

/// Redis connection settings shared by the inventory store and the queue.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL.
    pub url: String,
    /// Maximum pool size for the connection manager.
    pub max_connections: u32,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl RedisConfig {
    fn from_env() -> Self {
        Self {
            url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            max_connections: env::var("REDIS_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
            connect_timeout: Duration::from_secs(
                env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            ),
        }
    }
}

/// Event bus topics and tuning.
#[derive(Debug, Clone)]
pub struct RedpandaConfig {
    /// Bootstrap broker list.
    pub brokers: String,
    /// Consumer group id for saga step workers and the reconciliation worker.
    pub consumer_group: String,
    /// Session timeout passed to the consumer.
    pub session_timeout: Duration,
    /// Producer acknowledgement setting, e.g. `"all"`.
    pub producer_acks: String,
}

impl RedpandaConfig {
    fn from_env() -> Self {
        Self {
            brokers: env::var("REDPANDA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
            consumer_group: env::var("REDPANDA_CONSUMER_GROUP")
                .unwrap_or_else(|_| "reservations".to_string()),
            session_timeout: Duration::from_millis(
                env::var("REDPANDA_SESSION_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10_000),
            ),
            producer_acks: env::var("REDPANDA_PRODUCER_ACKS").unwrap_or_else(|_| "all".to_string()),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// `tracing_subscriber` filter directive.
    pub log_level: String,
    /// Graceful shutdown grace period.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            shutdown_timeout: Duration::from_secs(
                env::var("SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

/// Inventory and reservation TTL tuning.
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// How long a `Reserved` booking holds its seats before reclaim.
    pub reservation_ttl: Duration,
    /// Maximum confirmed+reserved tickets a single user may hold per event.
    pub per_user_ticket_cap: u32,
    /// TTL on the AIS per-user ticket counter. Refreshed on every reserve,
    /// so an active user's cap stays enforced; long enough to outlive a
    /// typical on-sale window so a confirmed booking isn't silently
    /// forgotten by the counter while the event is still selling.
    pub user_count_ttl: Duration,
}

impl InventoryConfig {
    fn from_env() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(
                env::var("RESERVATION_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            per_user_ticket_cap: env::var("PER_USER_TICKET_CAP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8),
            user_count_ttl: Duration::from_secs(
                env::var("USER_COUNT_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(86_400),
            ),
        }
    }
}

/// Queue admission tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a queue entry lives before it is dropped for inactivity.
    pub entry_ttl: Duration,
    /// How often the release loop admits a new batch.
    pub release_interval: Duration,
    /// Number of users admitted per release tick.
    pub release_batch_size: u32,
    /// Queue-pass JWT lifetime.
    pub pass_ttl: Duration,
    /// HMAC secret used to sign queue-pass JWTs.
    pub jwt_secret: String,
    /// Events with an active release loop at process startup.
    ///
    /// The release loop is per-event (it admits off one event's waiting
    /// room at a time), and this crate has no events catalog of its own to
    /// discover them from, so the on-sale set is named explicitly here
    /// rather than scanned for.
    pub active_events: Vec<EventId>,
    /// Soft cap on concurrent waiting-room occupancy per event. `None`
    /// means unbounded.
    pub max_queue_length: Option<u64>,
    /// Assumed per-user service time, used to estimate wait for a caller at
    /// a given queue position.
    pub per_user_wait_seconds: u64,
}

impl QueueConfig {
    fn from_env() -> Self {
        Self {
            entry_ttl: Duration::from_secs(
                env::var("QUEUE_ENTRY_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1800),
            ),
            release_interval: Duration::from_millis(
                env::var("QUEUE_RELEASE_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            release_batch_size: env::var("QUEUE_RELEASE_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            pass_ttl: Duration::from_secs(
                env::var("QUEUE_PASS_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            jwt_secret: env::var("QUEUE_JWT_SECRET")
                .unwrap_or_else(|_| "development-only-secret-do-not-use-in-prod".to_string()),
            active_events: env::var("QUEUE_ACTIVE_EVENTS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .filter_map(|s| s.trim().parse::<Uuid>().ok())
                        .map(EventId)
                        .collect()
                })
                .unwrap_or_default(),
            max_queue_length: env::var("QUEUE_MAX_LENGTH").ok().and_then(|s| s.parse().ok()),
            per_user_wait_seconds: env::var("QUEUE_PER_USER_WAIT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        }
    }
}

/// Saga step timeout and retry tuning.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Per-step command timeout before it is considered failed.
    pub step_timeout: Duration,
    /// Maximum retry attempts per step, before compensation begins.
    pub max_step_attempts: u32,
}

impl SagaConfig {
    fn from_env() -> Self {
        Self {
            step_timeout: Duration::from_secs(
                env::var("SAGA_STEP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            max_step_attempts: env::var("SAGA_MAX_STEP_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        }
    }
}

/// Expiration worker scan cadence.
#[derive(Debug, Clone)]
pub struct ExpirationConfig {
    /// How often the worker scans the repository for expired reservations.
    pub scan_interval: Duration,
    /// Maximum rows reclaimed per scan tick.
    pub scan_batch_size: u32,
}

impl ExpirationConfig {
    fn from_env() -> Self {
        Self {
            scan_interval: Duration::from_secs(
                env::var("EXPIRATION_SCAN_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            scan_batch_size: env::var("EXPIRATION_SCAN_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),
        }
    }
}

/// Outbox relay poll cadence.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// How often the relay polls `booking_outbox` for unrelayed rows.
    pub poll_interval: Duration,
    /// Maximum rows relayed per poll tick.
    pub batch_size: u32,
}

impl OutboxConfig {
    fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(
                env::var("OUTBOX_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            ),
            batch_size: env::var("OUTBOX_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),
        }
    }
}

/// Reconciliation worker scan cadence.
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// How often the worker re-derives booking status from the repository.
    pub scan_interval: Duration,
    /// Maximum rows reconciled per scan tick.
    pub scan_batch_size: u32,
}

impl ReconciliationConfig {
    fn from_env() -> Self {
        Self {
            scan_interval: Duration::from_secs(
                env::var("RECONCILIATION_SCAN_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            scan_batch_size: env::var("RECONCILIATION_SCAN_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env_vars() {
        let config = Config::from_env();
        assert!(config.inventory.per_user_ticket_cap > 0);
        assert!(config.inventory.user_count_ttl.as_secs() > 0);
        assert!(config.queue.release_batch_size > 0);
        assert!(config.saga.max_step_attempts > 0);
    }
}
