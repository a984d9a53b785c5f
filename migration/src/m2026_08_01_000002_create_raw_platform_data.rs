//! Migration to create the raw_platform_data table.
//!
//! This migration creates the append-only table holding raw provider payloads
//! captured by the poll scheduler. Rows are written once and never updated.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RawPlatformData::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RawPlatformData::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RawPlatformData::UserId).uuid().not_null())
                    .col(ColumnDef::new(RawPlatformData::Provider).text().not_null())
                    .col(ColumnDef::new(RawPlatformData::DataType).text().not_null())
                    .col(
                        ColumnDef::new(RawPlatformData::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RawPlatformData::ExtractedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Create index on (user_id, provider) for per-connection reads
        manager
            .create_index(
                Index::create()
                    .name("idx_raw_platform_data_user_provider")
                    .table(RawPlatformData::Table)
                    .col(RawPlatformData::UserId)
                    .col(RawPlatformData::Provider)
                    .to_owned(),
            )
            .await?;

        // Create index on extracted_at for time-range scans
        manager
            .create_index(
                Index::create()
                    .name("idx_raw_platform_data_extracted_at")
                    .table(RawPlatformData::Table)
                    .col(RawPlatformData::ExtractedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop indexes first
        manager
            .drop_index(
                Index::drop()
                    .name("idx_raw_platform_data_user_provider")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_raw_platform_data_extracted_at")
                    .to_owned(),
            )
            .await?;

        // Then drop table
        manager
            .drop_table(Table::drop().table(RawPlatformData::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RawPlatformData {
    Table,
    Id,
    UserId,
    Provider,
    DataType,
    Payload,
    ExtractedAt,
}
