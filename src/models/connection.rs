//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which stores per-user OAuth authorizations to external platforms.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Connection entity representing a user's authorization to one platform
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Platform identifier, e.g. `spotify` (unique per user)
    pub provider: String,

    /// Lifecycle status, see [`ConnectionStatus`]
    pub status: String,

    /// AES-256-GCM sealed access token
    pub access_token_ciphertext: Option<Vec<u8>>,

    /// AES-256-GCM sealed refresh token; absent for providers that never
    /// issue one
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry; null means the token does not expire
    pub token_expires_at: Option<DateTimeWithTimeZone>,

    /// When this connection was last synced (refresh or poll)
    pub last_sync: Option<DateTimeWithTimeZone>,

    /// Human-readable outcome of the last sync, e.g. `token_refreshed`
    pub last_sync_status: Option<String>,

    /// Detail of the most recent failure, cleared on success
    pub error_message: Option<String>,

    /// Provider-side account id or login, used for URL templating
    pub platform_user_id: Option<String>,

    /// Provider-specific extras (e.g. `username`)
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Timestamp when the connection was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle states of a connection.
///
/// Stored as text so rows written by earlier revisions keep loading; the
/// legacy value `expired` parses as [`ConnectionStatus::TokenExpired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connected,
    TokenExpired,
    NeedsReauth,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::TokenExpired => "token_expired",
            ConnectionStatus::NeedsReauth => "needs_reauth",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connected" => Some(ConnectionStatus::Connected),
            "token_expired" | "expired" => Some(ConnectionStatus::TokenExpired),
            "needs_reauth" => Some(ConnectionStatus::NeedsReauth),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
