//! Database connection and pool management for the sync service.

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;

const CONNECT_ATTEMPTS: u32 = 5;

/// Errors that can occur during database setup.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Initializes the SeaORM connection pool.
///
/// Pool size and acquire timeout come from the configuration; transient
/// connect failures are retried with exponential backoff before giving up.
///
/// # Examples
///
/// ```no_run
/// use soulsig_sync::{config::AppConfig, db::init_pool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = AppConfig::default();
///     let db = init_pool(&config).await?;
///     Ok(())
/// }
/// ```
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "database URL cannot be empty".to_string(),
        }
        .into());
    }

    let mut opts = ConnectOptions::new(&cfg.database_url);
    opts.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let mut backoff = Duration::from_millis(100);
    let mut attempt = 1u32;

    loop {
        match Database::connect(opts.clone()).await {
            Ok(pool) => {
                tracing::info!(attempt, "Database pool ready");
                return Ok(pool);
            }
            Err(source) if attempt < CONNECT_ATTEMPTS => {
                tracing::warn!(
                    attempt,
                    error = %source,
                    "Database connect failed, retrying in {:?}",
                    backoff
                );
                sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(source) => {
                tracing::error!(
                    attempts = CONNECT_ATTEMPTS,
                    error = %source,
                    "Giving up on database connection"
                );
                return Err(DatabaseError::ConnectionFailed { source }.into());
            }
        }
    }
}

/// Pings the pool; an error means the database is unreachable or the pool
/// is exhausted.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    db.ping().await.context("database ping failed")?;
    Ok(())
}
