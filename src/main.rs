//! # Sync Service Main Entry Point
//!
//! This is the main entry point for the Soul Signature sync service.

use std::sync::Arc;

use rand::RngCore;
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use soulsig_sync::config::ConfigLoader;
use soulsig_sync::crypto::CryptoKey;
use soulsig_sync::db;
use soulsig_sync::inflight::InFlightGuards;
use soulsig_sync::migration::Migrator;
use soulsig_sync::poller::PollScheduler;
use soulsig_sync::providers::Registry;
use soulsig_sync::rate_limit::{InMemoryStore, RateLimiter};
use soulsig_sync::repositories::{ConnectionRepository, RawDatumRepository};
use soulsig_sync::server::{AppState, run_server};
use soulsig_sync::telemetry;
use soulsig_sync::token_refresh::TokenRefreshService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from layered env files and variables
    let config_loader = ConfigLoader::new();
    let config = Arc::new(config_loader.load()?);

    telemetry::init_tracing(&config)?;

    println!("Loaded configuration for profile: {}", config.profile);
    println!("Configuration: {}", config.redacted_json());

    let db = Arc::new(db::init_pool(&config).await?);
    Migrator::up(db.as_ref(), None).await?;

    let crypto_key = CryptoKey::new(match config.crypto_key.clone() {
        Some(key) => key,
        None => {
            // validate() only lets this through on local/test profiles.
            // Tokens sealed with an ephemeral key are unreadable after a
            // restart, which is acceptable for throwaway environments.
            warn!("No crypto key configured; generating an ephemeral key for this process");
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            key
        }
    })?;

    let repo = Arc::new(ConnectionRepository::new(
        Arc::clone(&db),
        crypto_key.clone(),
    ));
    let raw_data = Arc::new(RawDatumRepository::new(Arc::clone(&db)));
    let registry = Arc::new(Registry::builtin(&config));
    info!(providers = registry.len(), "Provider registry initialized");

    // One in-flight set shared by both schedulers so a manual refresh and a
    // poll never work the same connection at once.
    let in_flight = InFlightGuards::new();

    let token_refresh = Arc::new(TokenRefreshService::new(
        Arc::clone(&config),
        Arc::clone(&repo),
        Arc::clone(&registry),
        in_flight.clone(),
    ));
    let poller = Arc::new(PollScheduler::new(
        Arc::clone(&config),
        Arc::clone(&repo),
        Arc::clone(&raw_data),
        Arc::clone(&registry),
        in_flight,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::new(InMemoryStore::new()),
        config.rate_limit.clone(),
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    if config.token_refresh.enabled {
        let service = Arc::clone(&token_refresh);
        let token = shutdown.clone();
        tokio::spawn(async move { service.run(token).await });
    } else {
        info!("Token refresh scheduler disabled by configuration");
    }

    if config.poll.enabled {
        let service = Arc::clone(&poller);
        let token = shutdown.clone();
        tokio::spawn(async move { service.run(token).await });
    } else {
        info!("Poll scheduler disabled by configuration");
    }

    let state = AppState {
        config: Arc::clone(&config),
        db,
        repo,
        token_refresh,
        poller,
        rate_limiter,
    };

    let result = run_server(state, shutdown.clone()).await;

    // Stop the schedulers even when the server exited on its own.
    shutdown.cancel();

    result
}

/// Cancel the token on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    warn!(error = %error, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }

        shutdown.cancel();
    });
}
