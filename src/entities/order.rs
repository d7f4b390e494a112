use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::Iterable;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Fulfillment axis of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "preparing")]
    Preparing,
    #[sea_orm(string_value = "on-the-way")]
    OnTheWay,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// Payment axis of an order, independent of [`OrderStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "kebab-case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "cash-on-delivery")]
    CashOnDelivery,
    #[sea_orm(string_value = "khalti")]
    Khalti,
    #[sea_orm(string_value = "esewa")]
    Esewa,
}

impl OrderStatus {
    /// Parses the wire value (`"on-the-way"`, ...). Unknown values yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::iter().find(|s| s.to_value() == raw.trim())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }
}

impl PaymentStatus {
    /// Money has been captured, whether or not it is on its way back.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::Refunded)
    }
}

/// Payment states a provider callback must never overwrite.
pub const SETTLED_PAYMENT_STATUSES: [PaymentStatus; 2] = [PaymentStatus::Paid, PaymentStatus::Refunded];

impl PaymentMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        Self::iter().find(|m| m.to_value() == raw.trim())
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, Self::CashOnDelivery)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Human-readable code, e.g. `ORD-LZ3K9F1A-7QX2M`.
    #[sea_orm(unique)]
    pub order_code: String,
    pub customer_id: Uuid,
    pub vendor_id: Uuid,
    #[sea_orm(column_type = "JsonBinary")]
    pub delivery_address: Json,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub delivery_fee: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub total: Decimal,
    pub promo_code: Option<String>,
    pub promo_code_id: Option<Uuid>,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    #[sea_orm(unique)]
    pub khalti_transaction_id: Option<String>,
    #[sea_orm(unique)]
    pub esewa_transaction_id: Option<String>,
    pub esewa_ref_id: Option<String>,
    /// Raw provider payloads kept for audit.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub payment_details: Option<Json>,
    pub notes: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
    pub cancelled_by_role: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(
        belongs_to = "super::vendor::Entity",
        from = "Column::VendorId",
        to = "super::vendor::Column::Id"
    )]
    Vendor,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::vendor::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vendor.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_values() {
        assert_eq!(OrderStatus::parse("on-the-way"), Some(OrderStatus::OnTheWay));
        assert_eq!(OrderStatus::parse("delivered"), Some(OrderStatus::Delivered));
        assert_eq!(OrderStatus::parse("shipped"), None);
        assert_eq!(
            PaymentMethod::parse("cash-on-delivery"),
            Some(PaymentMethod::CashOnDelivery)
        );
        assert_eq!(PaymentMethod::parse("paypal"), None);
    }

    #[test]
    fn display_matches_serde() {
        let json = serde_json::to_string(&OrderStatus::OnTheWay).unwrap();
        assert_eq!(json, format!("\"{}\"", OrderStatus::OnTheWay));
        let json = serde_json::to_string(&PaymentMethod::CashOnDelivery).unwrap();
        assert_eq!(json, format!("\"{}\"", PaymentMethod::CashOnDelivery));
    }
}
