use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Broker connection string (default: redis://localhost:6379)
    pub broker_url: String,

    /// Name of the durable notification queue (default: notifications)
    pub queue_name: String,

    /// Consumer group shared by all pool workers (default: courier)
    pub consumer_group: String,

    /// Name of the parking queue for poison messages (default: notifications:parked)
    pub parking_queue_name: String,

    /// Number of consumer pool workers (default: 4)
    pub worker_count: usize,

    /// Per-worker prefetch: max unacknowledged deliveries per channel (default: 8)
    pub prefetch_count: usize,

    /// Base delay for fast reconnect attempts in milliseconds (default: 1000)
    pub retry_base_ms: u64,

    /// Cap on the fast reconnect delay in milliseconds (default: 60000)
    pub retry_cap_ms: u64,

    /// Failed connect attempts before entering degraded mode (default: 6)
    pub max_fast_attempts: u32,

    /// Fixed retry interval while degraded, in seconds (default: 300)
    pub degraded_retry_secs: u64,

    /// How long to wait for in-flight messages to drain on shutdown (default: 10)
    pub drain_timeout_secs: u64,

    /// Deliveries of the same message before it is parked (default: 5)
    pub max_delivery_attempts: u32,

    /// Optional bound on queue length; oldest entries are dropped past it
    pub max_queue_length: Option<u64>,

    /// Bind address for the health endpoint (default: 0.0.0.0:3000)
    pub health_bind_addr: SocketAddr,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            broker_url: std::env::var("BROKER_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_name: std::env::var("QUEUE_NAME")
                .unwrap_or_else(|_| "notifications".to_string()),
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "courier".to_string()),
            parking_queue_name: std::env::var("PARKING_QUEUE_NAME")
                .unwrap_or_else(|_| "notifications:parked".to_string()),
            worker_count: std::env::var("WORKER_COUNT")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_COUNT must be a valid usize"))?,
            prefetch_count: std::env::var("PREFETCH_COUNT")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PREFETCH_COUNT must be a valid usize"))?,
            retry_base_ms: std::env::var("RETRY_BASE_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RETRY_BASE_MS must be a valid u64"))?,
            retry_cap_ms: std::env::var("RETRY_CAP_MS")
                .unwrap_or_else(|_| "60000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RETRY_CAP_MS must be a valid u64"))?,
            max_fast_attempts: std::env::var("MAX_FAST_ATTEMPTS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_FAST_ATTEMPTS must be a valid u32"))?,
            degraded_retry_secs: std::env::var("DEGRADED_RETRY_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DEGRADED_RETRY_SECS must be a valid u64"))?,
            drain_timeout_secs: std::env::var("DRAIN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DRAIN_TIMEOUT_SECS must be a valid u64"))?,
            max_delivery_attempts: std::env::var("MAX_DELIVERY_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_DELIVERY_ATTEMPTS must be a valid u32"))?,
            max_queue_length: match std::env::var("MAX_QUEUE_LENGTH") {
                Ok(v) => Some(
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("MAX_QUEUE_LENGTH must be a valid u64"))?,
                ),
                Err(_) => None,
            },
            health_bind_addr: std::env::var("HEALTH_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("HEALTH_BIND_ADDR must be a valid socket address"))?,
        })
    }

    /// Drain timeout as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
