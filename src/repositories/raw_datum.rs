//! Raw platform data repository
//!
//! Append-only storage for provider payloads. The poll scheduler writes one
//! row per successful sub-resource fetch; nothing in this service updates or
//! deletes rows afterwards.

use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::raw_datum::{self, Entity as RawDatum};

/// Repository for raw platform data operations
#[derive(Debug, Clone)]
pub struct RawDatumRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl RawDatumRepository {
    /// Creates a new RawDatumRepository instance
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Appends one captured payload.
    pub async fn insert(
        &self,
        user_id: &Uuid,
        provider: &str,
        data_type: &str,
        payload: JsonValue,
    ) -> Result<raw_datum::Model> {
        let id = Uuid::new_v4();

        let active = raw_datum::ActiveModel {
            id: Set(id),
            user_id: Set(*user_id),
            provider: Set(provider.to_string()),
            data_type: Set(data_type.to_string()),
            payload: Set(payload),
            extracted_at: Set(Utc::now().into()),
        };
        active.insert(&*self.db).await?;

        // For SQLite, query the record directly since we already know the ID
        let fetched = RawDatum::find_by_id(id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("raw datum not persisted"))
    }

    /// Lists captured payloads for a user/provider pair, newest first.
    pub async fn find_by_user_provider(
        &self,
        user_id: &Uuid,
        provider: &str,
    ) -> Result<Vec<raw_datum::Model>> {
        Ok(RawDatum::find()
            .filter(raw_datum::Column::UserId.eq(*user_id))
            .filter(raw_datum::Column::Provider.eq(provider))
            .order_by_desc(raw_datum::Column::ExtractedAt)
            .order_by_desc(raw_datum::Column::Id)
            .all(&*self.db)
            .await?)
    }
}
