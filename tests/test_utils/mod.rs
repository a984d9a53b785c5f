//! Test utilities for database and scheduler testing.
//!
//! This module provides utilities for setting up in-memory SQLite databases
//! with migrations applied, plus connection fixtures and wiremock-friendly
//! provider registries.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, Database, DatabaseConnection};
use uuid::Uuid;

use soulsig_sync::config::AppConfig;
use soulsig_sync::crypto::CryptoKey;
use soulsig_sync::models::connection;
use soulsig_sync::providers::{
    GrantStyle, PollEndpoint, PollPlan, Provider, ProviderConfig, RefreshEndpoint, Registry,
    ResultShape,
};
use soulsig_sync::repositories::ConnectionRepository;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Sets up an in-memory SQLite database and returns it Arc-wrapped, ready
/// for the repositories.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(db))
}

/// Fixed 32-byte key so ciphertexts are decryptable across helpers.
#[allow(dead_code)]
pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("32 bytes is a valid key")
}

/// Scheduler-friendly configuration: test profile, no pacing pauses, no
/// startup jitter.
#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        ..AppConfig::default()
    };
    config.token_refresh.jitter_factor = 0.0;
    config.token_refresh.http_timeout_seconds = 5;
    config.poll.provider_pause_ms = 0;
    config.poll.user_pause_ms = 0;
    config.poll.http_timeout_seconds = 5;
    config
}

/// Inserts a connection with sealed tokens for a fresh user.
///
/// `expires_at` of `None` models a non-expiring token.
#[allow(dead_code)]
pub async fn insert_connection(
    repo: &ConnectionRepository,
    provider: Provider,
    access_token: Option<&str>,
    refresh_token: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<connection::Model> {
    let now = Utc::now();
    let active = connection::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(Uuid::new_v4()),
        provider: Set(provider.as_str().to_string()),
        status: Set("connected".to_string()),
        token_expires_at: Set(expires_at.map(Into::into)),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
        ..Default::default()
    };

    repo.create_with_tokens(active, access_token, refresh_token)
        .await
}

/// Overwrites the stored status, bypassing the repository's transitions.
#[allow(dead_code)]
pub async fn set_connection_status(
    db: &DatabaseConnection,
    connection: &connection::Model,
    status: &str,
) -> Result<connection::Model> {
    let mut active: connection::ActiveModel = connection.clone().into();
    active.status = Set(status.to_string());
    Ok(active.update(db).await?)
}

/// Sets the identity fields the poll URL templates draw from.
#[allow(dead_code)]
pub async fn set_platform_identity(
    db: &DatabaseConnection,
    connection: &connection::Model,
    platform_user_id: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<connection::Model> {
    let mut active: connection::ActiveModel = connection.clone().into();
    active.platform_user_id = Set(platform_user_id.map(str::to_string));
    active.metadata = Set(metadata);
    Ok(active.update(db).await?)
}

/// Registry with a single provider whose token endpoint is `token_url`.
#[allow(dead_code)]
pub fn refresh_registry(
    provider: Provider,
    grant_style: GrantStyle,
    token_url: &str,
    extra_params: &[(&str, &str)],
) -> Registry {
    Registry::from_configs(vec![ProviderConfig {
        provider,
        refresh: Some(RefreshEndpoint {
            token_url: token_url.to_string(),
            grant_style,
            client_id: "test-client-id".to_string(),
            client_secret: "test-client-secret".to_string(),
            extra_params: extra_params
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }),
        poll: None,
    }])
}

/// Registry with a single pollable provider.
#[allow(dead_code)]
pub fn poll_registry(
    provider: Provider,
    interval_seconds: u64,
    endpoints: Vec<PollEndpoint>,
) -> Registry {
    Registry::from_configs(vec![ProviderConfig {
        provider,
        refresh: None,
        poll: Some(PollPlan {
            interval_seconds,
            endpoints,
        }),
    }])
}

/// Poll endpoint without default query parameters.
#[allow(dead_code)]
pub fn poll_endpoint(data_type: &str, url_template: &str, result_shape: ResultShape) -> PollEndpoint {
    PollEndpoint {
        data_type: data_type.to_string(),
        url_template: url_template.to_string(),
        query: Vec::new(),
        result_shape,
    }
}
