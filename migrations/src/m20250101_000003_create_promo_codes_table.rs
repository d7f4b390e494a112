use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250101_000003_create_promo_codes_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PromoCodes::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(PromoCodes::Id).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(PromoCodes::Code)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PromoCodes::Description).string().null())
                    .col(ColumnDef::new(PromoCodes::DiscountType).string_len(16).not_null())
                    .col(
                        ColumnDef::new(PromoCodes::DiscountValue)
                            .decimal_len(12, 2)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PromoCodes::MinOrderAmount)
                            .decimal_len(12, 2)
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(PromoCodes::MaxDiscount).decimal_len(12, 2).null())
                    .col(
                        ColumnDef::new(PromoCodes::UsageLimit)
                            .integer()
                            .not_null()
                            .default(-1),
                    )
                    .col(
                        ColumnDef::new(PromoCodes::UsedCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PromoCodes::ValidFrom)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PromoCodes::ValidUntil)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PromoCodes::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(PromoCodes::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PromoCodes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PromoCodes {
    Table,
    Id,
    Code,
    Description,
    DiscountType,
    DiscountValue,
    MinOrderAmount,
    MaxDiscount,
    UsageLimit,
    UsedCount,
    ValidFrom,
    ValidUntil,
    IsActive,
    CreatedAt,
}
