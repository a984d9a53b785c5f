//! Raw platform datum entity model
//!
//! This module contains the SeaORM entity model for the raw_platform_data
//! table. Rows hold provider responses exactly as returned by the platform
//! and are append-only: written once by the poll scheduler, never updated.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One raw payload captured from a provider sub-resource
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "raw_platform_data")]
pub struct Model {
    /// Unique identifier for the datum (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Platform the payload came from
    pub provider: String,

    /// Sub-resource name, e.g. `recently_played`
    pub data_type: String,

    /// Provider response body, unmodified
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// When the payload was captured
    pub extracted_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
