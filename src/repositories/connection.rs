//! Connection repository for database operations
//!
//! This module provides the ConnectionRepository struct which encapsulates
//! SeaORM operations for the connections table: due-for-refresh selection,
//! sealed token updates, and the status transitions driven by the schedulers.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{CryptoKey, decrypt_connection_tokens, encrypt_connection_tokens};
use crate::models::ConnectionStatus;
use crate::models::connection::{self, Entity as Connection};

/// Statuses eligible for token refresh. Rows written by earlier revisions
/// may still carry the legacy `expired` value.
const REFRESHABLE_STATUSES: [&str; 3] = ["connected", "token_expired", "expired"];

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Crypto key for token sealing
    pub crypto_key: CryptoKey,
}

impl ConnectionRepository {
    /// Creates a new ConnectionRepository instance
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Lists connections whose access token expires within `within` from now,
    /// ordered by expiry.
    ///
    /// Rows without a refresh token ciphertext are never returned: there is
    /// nothing to refresh them with. Neither are `needs_reauth` or
    /// `disconnected` rows, which stay parked until the user reconnects.
    pub async fn list_due_for_refresh(&self, within: Duration) -> Result<Vec<connection::Model>> {
        let horizon: DateTimeWithTimeZone = (Utc::now() + within).into();

        Ok(Connection::find()
            .filter(connection::Column::Status.is_in(REFRESHABLE_STATUSES))
            .filter(connection::Column::RefreshTokenCiphertext.is_not_null())
            .filter(connection::Column::TokenExpiresAt.is_not_null())
            .filter(connection::Column::TokenExpiresAt.lte(horizon))
            .order_by_asc(connection::Column::TokenExpiresAt)
            .all(&*self.db)
            .await?)
    }

    /// Lists all connections in any of the given statuses, ordered by user
    /// then provider.
    pub async fn list_by_status(
        &self,
        statuses: &[ConnectionStatus],
    ) -> Result<Vec<connection::Model>> {
        let values: Vec<&str> = statuses.iter().map(ConnectionStatus::as_str).collect();

        Ok(Connection::find()
            .filter(connection::Column::Status.is_in(values))
            .order_by_asc(connection::Column::UserId)
            .order_by_asc(connection::Column::Provider)
            .all(&*self.db)
            .await?)
    }

    /// Stores a freshly minted token pair on a connection.
    ///
    /// When the provider omitted a new refresh token the stored refresh
    /// ciphertext is left untouched, since most providers expect the old one
    /// to be reused. Marks the connection `connected` and clears any stale
    /// error message.
    pub async fn update_tokens(
        &self,
        connection: &connection::Model,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<connection::Model> {
        let (access_cipher, refresh_cipher) = encrypt_connection_tokens(
            &self.crypto_key,
            connection,
            Some(access_token),
            refresh_token,
        )
        .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        let mut model: connection::ActiveModel = connection.clone().into();
        model.access_token_ciphertext = Set(access_cipher);
        if refresh_cipher.is_some() {
            model.refresh_token_ciphertext = Set(refresh_cipher);
        }
        model.status = Set(ConnectionStatus::Connected.as_str().to_string());
        model.token_expires_at = Set(Some(expires_at.into()));
        model.last_sync_status = Set(Some("token_refreshed".to_string()));
        model.error_message = Set(None);
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Parks a connection until the user re-authorizes it.
    pub async fn mark_needs_reauth(
        &self,
        user_id: &Uuid,
        provider: &str,
        reason: &str,
    ) -> Result<()> {
        let existing = self
            .find_by_user_provider(user_id, provider)
            .await?
            .ok_or_else(|| anyhow!("Connection for user '{}' and '{}' not found", user_id, provider))?;

        let mut model: connection::ActiveModel = existing.into();
        model.status = Set(ConnectionStatus::NeedsReauth.as_str().to_string());
        model.error_message = Set(Some(reason.to_string()));
        model.updated_at = Set(Utc::now().into());
        model.update(&*self.db).await?;

        Ok(())
    }

    /// Records the outcome of a sync pass over one connection.
    pub async fn mark_sync_result(
        &self,
        user_id: &Uuid,
        provider: &str,
        success: bool,
        detail: &str,
    ) -> Result<()> {
        let existing = self
            .find_by_user_provider(user_id, provider)
            .await?
            .ok_or_else(|| anyhow!("Connection for user '{}' and '{}' not found", user_id, provider))?;

        let mut model: connection::ActiveModel = existing.into();
        model.last_sync = Set(Some(Utc::now().into()));
        model.last_sync_status = Set(Some(
            if success { "success" } else { "failed" }.to_string(),
        ));
        model.error_message = Set(if success { None } else { Some(detail.to_string()) });
        model.updated_at = Set(Utc::now().into());
        model.update(&*self.db).await?;

        Ok(())
    }

    /// Decrypts the access token of a connection, or `None` when the row has
    /// no ciphertext or the ciphertext fails authentication.
    ///
    /// Failures are logged, never returned: a bad row must not abort a batch.
    pub async fn decrypt_access_token(&self, connection: &connection::Model) -> Option<String> {
        match decrypt_connection_tokens(&self.crypto_key, connection) {
            Ok((access, _)) => access,
            Err(_) => {
                tracing::warn!(
                    user_id = %connection.user_id,
                    provider = %connection.provider,
                    "Access token decryption failed"
                );
                None
            }
        }
    }

    /// Decrypts the refresh token of a connection; same failure contract as
    /// [`Self::decrypt_access_token`].
    pub async fn decrypt_refresh_token(&self, connection: &connection::Model) -> Option<String> {
        match decrypt_connection_tokens(&self.crypto_key, connection) {
            Ok((_, refresh)) => refresh,
            Err(_) => {
                tracing::warn!(
                    user_id = %connection.user_id,
                    provider = %connection.provider,
                    "Refresh token decryption failed"
                );
                None
            }
        }
    }

    /// Creates a connection with encrypted tokens
    pub async fn create_with_tokens(
        &self,
        mut connection: connection::ActiveModel,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<connection::Model> {
        let connection_id = connection
            .id
            .clone()
            .take()
            .ok_or_else(|| anyhow!("connection id must be set"))?;
        let user_id = connection
            .user_id
            .clone()
            .take()
            .ok_or_else(|| anyhow!("connection user_id must be set"))?;
        let provider = connection
            .provider
            .clone()
            .take()
            .ok_or_else(|| anyhow!("connection provider must be set"))?;

        // Temporary model carrying the identity fields the AAD is derived from
        let temp_connection = connection::Model {
            id: connection_id,
            user_id,
            provider,
            status: ConnectionStatus::Connected.as_str().to_string(),
            access_token_ciphertext: None,
            refresh_token_ciphertext: None,
            token_expires_at: None,
            last_sync: None,
            last_sync_status: None,
            error_message: None,
            platform_user_id: None,
            metadata: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        };

        let (encrypted_access_token, encrypted_refresh_token) = encrypt_connection_tokens(
            &self.crypto_key,
            &temp_connection,
            access_token,
            refresh_token,
        )
        .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        connection.access_token_ciphertext = Set(encrypted_access_token);
        connection.refresh_token_ciphertext = Set(encrypted_refresh_token);

        let active = connection;
        active.insert(&*self.db).await?;

        // For SQLite, query the record directly since we already know the ID
        let fetched = Connection::find_by_id(connection_id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("connection not persisted"))
    }

    /// Finds a connection by its ID
    pub async fn find_by_id(&self, id: &Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(*id).one(&*self.db).await?)
    }

    /// Finds a connection by its unique `(user, provider)` pair
    pub async fn find_by_user_provider(
        &self,
        user_id: &Uuid,
        provider: &str,
    ) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(*user_id))
            .filter(connection::Column::Provider.eq(provider))
            .one(&*self.db)
            .await?)
    }
}
