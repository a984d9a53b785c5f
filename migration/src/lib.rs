//! Database migrations for the Soul Signature sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_08_01_000001_create_connections;
mod m2026_08_01_000002_create_raw_platform_data;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_08_01_000001_create_connections::Migration),
            Box::new(m2026_08_01_000002_create_raw_platform_data::Migration),
        ]
    }
}
