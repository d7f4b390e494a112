//! Pure order-total computation. No I/O.

use crate::entities::product_variant;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use utoipa::ToSchema;

/// Threshold and flat fee deciding the delivery charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFeeSchedule {
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64, example = 500)]
    pub free_threshold: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64, example = 50)]
    pub fee: Decimal,
}

impl Default for DeliveryFeeSchedule {
    fn default() -> Self {
        Self {
            free_threshold: dec!(500),
            fee: dec!(50),
        }
    }
}

impl DeliveryFeeSchedule {
    /// Free strictly above the threshold, flat fee otherwise.
    pub fn fee_for(&self, amount: Decimal) -> Decimal {
        if amount > self.free_threshold {
            Decimal::ZERO
        } else {
            self.fee
        }
    }
}

/// A priced cart line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PricedLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub delivery_fee: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    /// Amount charged for goods, before delivery.
    pub fn goods_amount(&self) -> Decimal {
        self.subtotal - self.discount
    }
}

pub fn subtotal(lines: &[PricedLine]) -> Decimal {
    lines.iter().map(PricedLine::line_total).sum()
}

/// `total = subtotal - discount + deliveryFee`, with the discount clamped to `[0, subtotal]`.
/// A negative total is returned as-is for the caller to reject.
pub fn compute_totals(
    lines: &[PricedLine],
    promo_discount: Option<Decimal>,
    schedule: &DeliveryFeeSchedule,
) -> OrderTotals {
    let subtotal = subtotal(lines);
    let discount = promo_discount
        .unwrap_or(Decimal::ZERO)
        .max(Decimal::ZERO)
        .min(subtotal);
    let delivery_fee = schedule.fee_for(subtotal - discount);

    OrderTotals {
        subtotal,
        discount,
        delivery_fee,
        total: subtotal - discount + delivery_fee,
    }
}

/// Variant price when `requested` names a known variant, base price otherwise.
/// The returned label is `Some` only for a matched variant.
pub fn resolve_unit_price(
    base_price: Decimal,
    variants: &[product_variant::Model],
    requested: Option<&str>,
) -> (Decimal, Option<String>) {
    let Some(name) = requested.map(str::trim).filter(|n| !n.is_empty()) else {
        return (base_price, None);
    };
    variants
        .iter()
        .find(|v| v.name.eq_ignore_ascii_case(name))
        .map(|v| (v.price, Some(v.name.clone())))
        .unwrap_or((base_price, None))
}
