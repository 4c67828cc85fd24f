//! Reservation, queue-admission, and booking-confirmation saga service.

use std::sync::Arc;

use composable_rust_core::environment::SystemClock;
use composable_rust_core::event_bus::EventBus;
use composable_rust_redpanda::RedpandaEventBus;
use reservations::config::Config;
use reservations::inventory::AtomicInventoryStore;
use reservations::jwt::QueuePassSigner;
use reservations::queue::QueueAdmissionController;
use reservations::outbox::OutboxRelay;
use reservations::reconciliation::ReconciliationWorker;
use reservations::repository::ReservationRepository;
use reservations::expiration_worker::ExpirationWorker;
use reservations::reservation_service::ReservationService;
use reservations::saga::{SagaEnvironment, SagaOrchestrator, SagaStepWorkers, SagaStore};
use reservations::server::{self, AppState};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("reservations={},tower_http=debug", config.server.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting reservations service");

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(config.postgres.connect_timeout)
        .connect(&config.postgres.url)
        .await?;
    sqlx::migrate!("./migrations").run(&pg_pool).await?;
    info!("connected to postgres and ran migrations");

    let redis_client = redis::Client::open(config.redis.url.clone())?;
    let redis_conn = redis_client.get_connection_manager().await?;
    info!("connected to redis");

    let event_bus: Arc<dyn EventBus> = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .build()?,
    );
    info!("connected to event bus");

    let inventory = AtomicInventoryStore::new(redis_conn.clone());
    let repository = ReservationRepository::new(pg_pool.clone());
    let reservation_service = Arc::new(ReservationService::with_user_count_ttl(
        inventory,
        repository,
        event_bus.clone(),
        config.inventory.reservation_ttl,
        config.inventory.per_user_ticket_cap,
        config.inventory.user_count_ttl,
    ));

    let signer = QueuePassSigner::new(
        &config.queue.jwt_secret,
        "reservations",
        i64::try_from(config.queue.pass_ttl.as_secs()).unwrap_or(i64::MAX),
    );
    let queue = Arc::new(QueueAdmissionController::new(
        redis_conn.clone(),
        signer,
        config.queue.entry_ttl,
        config.queue.pass_ttl,
        config.queue.max_queue_length,
        config.queue.per_user_wait_seconds,
    ));

    let saga_store = SagaStore::new(pg_pool.clone());
    let saga_environment = SagaEnvironment {
        clock: Arc::new(SystemClock),
        event_bus: event_bus.clone(),
        store: saga_store,
    };
    let saga = Arc::new(SagaOrchestrator::restore(saga_environment).await?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let ack_consumer_saga = saga.clone();
    let ack_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { ack_consumer_saga.run_ack_consumer(ack_shutdown).await });

    let step_workers = SagaStepWorkers::new(
        reservation_service.clone(),
        event_bus.clone(),
        config.saga.max_step_attempts,
    );
    let step_workers_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { step_workers.run(step_workers_shutdown).await });

    let expiration_worker = ExpirationWorker::new(
        reservation_service.clone(),
        config.expiration.scan_interval,
        config.expiration.scan_batch_size,
    );
    let expiration_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { expiration_worker.run(expiration_shutdown).await });

    let reconciliation_worker = ReconciliationWorker::new(
        pg_pool.clone(),
        event_bus.clone(),
        config.reconciliation.scan_interval,
        config.reconciliation.scan_batch_size as usize,
    );
    let reconciliation_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { reconciliation_worker.run(reconciliation_shutdown).await });

    let outbox_relay = OutboxRelay::new(
        pg_pool.clone(),
        event_bus.clone(),
        config.outbox.poll_interval,
        config.outbox.batch_size,
    );
    let outbox_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { outbox_relay.run(outbox_shutdown).await });

    for event_id in config.queue.active_events.clone() {
        let queue = queue.clone();
        let interval = config.queue.release_interval;
        let batch_size = u64::from(config.queue.release_batch_size);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            queue.run_release_loop(event_id, interval, batch_size, shutdown).await;
        });
    }
    info!(
        active_events = config.queue.active_events.len(),
        "queue release loops started"
    );

    let state = AppState {
        reservations: reservation_service,
        queue,
        saga,
        pg_pool,
        redis: redis_conn,
    };

    let app = server::router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    info!("server stopped");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM, then broadcasts shutdown to every
/// background worker before letting axum drain in-flight requests.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("received SIGTERM, shutting down gracefully"),
    }

    let _ = shutdown_tx.send(());
}
