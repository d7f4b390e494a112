use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Usage limit value meaning the code can be redeemed any number of times.
pub const UNLIMITED_USAGE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "fixed")]
    Fixed,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "promo_codes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Stored upper-cased.
    #[sea_orm(unique)]
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub discount_value: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub min_order_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))", nullable)]
    pub max_discount: Option<Decimal>,
    pub usage_limit: i32,
    pub used_count: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Active, inside its validity window, and not exhausted.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && now >= self.valid_from
            && now <= self.valid_until
            && (self.usage_limit == UNLIMITED_USAGE || self.used_count < self.usage_limit)
    }

    /// Discount for an order amount, capped by `max_discount` and never above the amount itself.
    /// A cap of zero or less means no cap.
    pub fn discount_for(&self, order_total: Decimal) -> Decimal {
        let raw = match self.discount_type {
            DiscountType::Percentage => {
                let pct = order_total * self.discount_value / Decimal::ONE_HUNDRED;
                match self.max_discount {
                    Some(cap) if cap > Decimal::ZERO && pct > cap => cap,
                    _ => pct,
                }
            }
            DiscountType::Fixed => self.discount_value,
        };
        raw.max(Decimal::ZERO).min(order_total).round_dp(2)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
