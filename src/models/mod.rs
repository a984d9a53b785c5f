//! # Data Models
//!
//! This module contains all the data models used throughout the sync service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod raw_datum;

pub use connection::ConnectionStatus;
pub use connection::Entity as Connection;
pub use raw_datum::Entity as RawDatum;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "soulsig-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
