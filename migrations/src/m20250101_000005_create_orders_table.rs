use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250101_000005_create_orders_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Orders::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Orders::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Orders::OrderCode).string_len(32).not_null())
                    .col(ColumnDef::new(Orders::CustomerId).uuid().not_null())
                    .col(ColumnDef::new(Orders::VendorId).uuid().not_null())
                    .col(ColumnDef::new(Orders::DeliveryAddress).json_binary().not_null())
                    .col(ColumnDef::new(Orders::Subtotal).decimal_len(12, 2).not_null())
                    .col(ColumnDef::new(Orders::Discount).decimal_len(12, 2).not_null())
                    .col(ColumnDef::new(Orders::DeliveryFee).decimal_len(12, 2).not_null())
                    .col(ColumnDef::new(Orders::Total).decimal_len(12, 2).not_null())
                    .col(ColumnDef::new(Orders::PromoCode).string_len(64).null())
                    .col(ColumnDef::new(Orders::PromoCodeId).uuid().null())
                    .col(
                        ColumnDef::new(Orders::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Orders::PaymentMethod).string_len(24).not_null())
                    .col(
                        ColumnDef::new(Orders::PaymentStatus)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Orders::KhaltiTransactionId).string().null())
                    .col(ColumnDef::new(Orders::EsewaTransactionId).string().null())
                    .col(ColumnDef::new(Orders::EsewaRefId).string().null())
                    .col(ColumnDef::new(Orders::PaymentDetails).json_binary().null())
                    .col(ColumnDef::new(Orders::Notes).text().null())
                    .col(ColumnDef::new(Orders::CancelReason).text().null())
                    .col(ColumnDef::new(Orders::CancelledBy).uuid().null())
                    .col(ColumnDef::new(Orders::CancelledByRole).string_len(16).null())
                    .col(ColumnDef::new(Orders::PaidAt).timestamp_with_time_zone().null())
                    .col(
                        ColumnDef::new(Orders::DeliveredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Orders::CancelledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Orders::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Orders::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Correlation ids are the lookup keys for provider callbacks.
        for (name, column) in [
            ("idx_orders_order_code", Orders::OrderCode),
            ("idx_orders_khalti_transaction_id", Orders::KhaltiTransactionId),
            ("idx_orders_esewa_transaction_id", Orders::EsewaTransactionId),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(Orders::Table)
                        .col(column)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
        }

        for (name, column) in [
            ("idx_orders_customer_id", Orders::CustomerId),
            ("idx_orders_vendor_id", Orders::VendorId),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(Orders::Table)
                        .col(column)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
        }

        manager
            .create_table(
                Table::create()
                    .table(OrderItems::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(OrderItems::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                    .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                    .col(ColumnDef::new(OrderItems::Position).integer().not_null())
                    .col(ColumnDef::new(OrderItems::Name).string().not_null())
                    .col(ColumnDef::new(OrderItems::Variant).string().null())
                    .col(ColumnDef::new(OrderItems::UnitPrice).decimal_len(12, 2).not_null())
                    .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                    .col(ColumnDef::new(OrderItems::LineTotal).decimal_len(12, 2).not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_order_items_order")
                            .from(OrderItems::Table, OrderItems::OrderId)
                            .to(Orders::Table, Orders::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_order_items_order_id")
                    .table(OrderItems::Table)
                    .col(OrderItems::OrderId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OrderItems::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Orders::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Orders {
    Table,
    Id,
    OrderCode,
    CustomerId,
    VendorId,
    DeliveryAddress,
    Subtotal,
    Discount,
    DeliveryFee,
    Total,
    PromoCode,
    PromoCodeId,
    Status,
    PaymentMethod,
    PaymentStatus,
    KhaltiTransactionId,
    EsewaTransactionId,
    EsewaRefId,
    PaymentDetails,
    Notes,
    CancelReason,
    CancelledBy,
    CancelledByRole,
    PaidAt,
    DeliveredAt,
    CancelledAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum OrderItems {
    Table,
    Id,
    OrderId,
    ProductId,
    Position,
    Name,
    Variant,
    UnitPrice,
    Quantity,
    LineTotal,
}
