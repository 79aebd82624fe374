//! Courier service binary entrypoint.
//!
//! Wires the full pipeline: config → storage → session gateway → broker
//! supervisor → consumer pool → health server, then shuts the pieces down
//! in order on Ctrl+C: drain workers first, close the connection last.

use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db;
use courier_gateway::{SessionGateway, SessionRegistry};
use courier_pipeline::{
    ConsumerPool, PgNotificationStore, PoolConfig, Processor, RetryPolicy, Supervisor,
};
use courier_transport::{QueueSpec, RedisTransport};

use courier_api::routes::create_router;
use courier_api::state::AppState;

/// How long `stop` waits for an in-flight reconnect attempt to observe
/// cancellation before aborting it.
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("courier_api=info,courier_pipeline=info")),
        )
        .json()
        .init();

    tracing::info!("Courier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and apply migrations
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    // Session registry is the capability the hub layer registers sessions
    // into; the pipeline only reads it through the gateway.
    let registry = Arc::new(SessionRegistry::new());
    let gateway = Arc::new(SessionGateway::new(Arc::clone(&registry)));
    let store = Arc::new(PgNotificationStore::new(pool.clone()));

    // Broker supervision
    let transport = RedisTransport::new(&config.broker_url);
    let policy = RetryPolicy::from_config(&config);
    let supervisor = Arc::new(Supervisor::new(transport, policy));
    supervisor.start().await;

    // Consumer pool
    let queue = QueueSpec::new(&config.queue_name, &config.consumer_group)
        .with_parking(&config.parking_queue_name)
        .with_max_length(config.max_queue_length);
    let processor = Arc::new(Processor::new(store, gateway, config.max_delivery_attempts));
    let consumer_pool = ConsumerPool::start(
        Arc::clone(&supervisor),
        processor,
        PoolConfig {
            queue,
            workers: config.worker_count,
            prefetch: config.prefetch_count,
        },
    );

    // Health server
    let state = AppState::new(pool, supervisor.subscribe());
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.health_bind_addr).await?;
    tracing::info!("Health endpoint listening on {}", config.health_bind_addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    // Workers stop and close their channels before the connection goes away.
    consumer_pool.shutdown(config.drain_timeout()).await;
    supervisor.stop(SUPERVISOR_STOP_TIMEOUT).await;

    tracing::info!("Courier stopped.");
    Ok(())
}
