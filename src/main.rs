//! Pushline delivery worker daemon.
//!
//! Main entry point for the push delivery service. Initializes the
//! database, the gateway client, and the delivery engine, and coordinates
//! graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use pushline_core::RealClock;
use pushline_delivery::{
    gateway::{GatewayConfig, HttpPushGateway},
    retry::RetryPolicy,
    DeliveryConfig, DeliveryEngine,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("Starting Pushline delivery service");

    // Load configuration from environment
    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        gateway_endpoint = %config.gateway.endpoint,
        worker_count = config.delivery.worker_count,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    // Create database connection pool
    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    // Run database migrations
    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    // Start the delivery engine
    let gateway = Arc::new(
        HttpPushGateway::new(config.gateway.clone())
            .context("Failed to build push gateway client")?,
    );
    let mut engine = DeliveryEngine::from_pool(
        &db_pool,
        gateway,
        config.delivery.clone(),
        Arc::new(RealClock::new()),
    );
    engine.start().await.context("Failed to start delivery engine")?;

    info!("Pushline is processing delivery jobs");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    engine.shutdown().await.context("Delivery engine shutdown failed")?;

    // Close database connections
    db_pool.close().await;
    info!("Database connections closed");

    info!("Pushline shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,pushline=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    // TODO: Use sqlx::migrate! macro once migrations are set up
    // For now, ensure tables exist

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}',
            sent BOOLEAN NOT NULL DEFAULT FALSE,
            read BOOLEAN NOT NULL DEFAULT FALSE,
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create notifications table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notification_jobs (
            id UUID PRIMARY KEY,
            notification_id UUID NOT NULL REFERENCES notifications(id),
            status TEXT NOT NULL DEFAULT 'pending',
            retries INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            message_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            processing_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create notification_jobs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_tokens (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            token TEXT NOT NULL,
            platform TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(user_id, token)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create device_tokens table")?;

    // Create indexes
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_notification_jobs_pending
        ON notification_jobs(status, created_at)
        WHERE status IN ('pending', 'processing')
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create notification_jobs status index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_notifications_user
        ON notifications(user_id, created_at DESC)
        WHERE deleted = FALSE
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create notifications user index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_device_tokens_user
        ON device_tokens(user_id, created_at)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create device_tokens user index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Service configuration.
struct Config {
    /// PostgreSQL connection string
    database_url: String,
    /// Maximum database connections
    database_max_connections: u32,
    /// Push gateway client settings
    gateway: GatewayConfig,
    /// Delivery engine settings
    delivery: DeliveryConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let api_key = std::env::var("PUSHLINE_FCM_API_KEY")
            .context("PUSHLINE_FCM_API_KEY environment variable not set")?;

        let mut gateway = GatewayConfig { api_key, ..GatewayConfig::default() };
        if let Ok(endpoint) = std::env::var("PUSHLINE_FCM_ENDPOINT") {
            gateway.endpoint = endpoint;
        }

        let mut delivery = DeliveryConfig::default();
        if let Some(worker_count) =
            std::env::var("PUSHLINE_WORKER_COUNT").ok().and_then(|s| s.parse().ok())
        {
            delivery.worker_count = worker_count;
        }
        if let Some(batch_limit) =
            std::env::var("PUSHLINE_BATCH_LIMIT").ok().and_then(|s| s.parse().ok())
        {
            delivery.batch_limit = batch_limit;
        }
        if let Some(poll_ms) =
            std::env::var("PUSHLINE_POLL_INTERVAL_MS").ok().and_then(|s| s.parse().ok())
        {
            delivery.poll_interval = Duration::from_millis(poll_ms);
        }
        if let Some(max_retries) =
            std::env::var("PUSHLINE_MAX_RETRIES").ok().and_then(|s| s.parse().ok())
        {
            delivery.retry_policy = RetryPolicy::new(max_retries);
        }

        Ok(Self { database_url, database_max_connections, gateway, delivery })
    }

    /// Returns database URL with password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(password_start) = self.database_url[..at_pos].rfind(':') {
                if let Some(user_start) = self.database_url[..password_start].rfind('/') {
                    return format!(
                        "{}//{}:***@{}",
                        &self.database_url[..user_start],
                        &self.database_url[user_start + 2..password_start],
                        &self.database_url[at_pos + 1..]
                    );
                }
            }
        }
        // Fallback: just return postgresql://***
        "postgresql://***".to_string()
    }
}
