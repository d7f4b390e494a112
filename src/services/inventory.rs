//! Inventory ledger: atomic stock decrements and low-stock crossing detection.

use crate::entities::product;
use crate::errors::ServiceError;
use crate::events::StockAlertLevel;
use sea_orm::{sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, error};
use uuid::Uuid;

/// Stock level at or below which a one-time alert fires.
pub const LOW_STOCK_THRESHOLD: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub product_id: Uuid,
    pub old_stock: i32,
    pub new_stock: i32,
}

impl StockChange {
    pub fn alert(&self) -> Option<StockAlertLevel> {
        crossing_alert(self.old_stock, self.new_stock)
    }
}

/// Alert level for a decrement from `old` to `new`, only on the transition itself.
pub fn crossing_alert(old: i32, new: i32) -> Option<StockAlertLevel> {
    if old > 0 && new == 0 {
        Some(StockAlertLevel::OutOfStock)
    } else if old > LOW_STOCK_THRESHOLD && new <= LOW_STOCK_THRESHOLD {
        Some(StockAlertLevel::LowStock)
    } else {
        None
    }
}

/// `stock = stock - quantity WHERE stock >= quantity`, executed on `db`
/// (normally the order-creation transaction). Untracked products are a no-op.
pub async fn decrement_stock<C: ConnectionTrait>(
    db: &C,
    product: &product::Model,
    quantity: i32,
) -> Result<Option<StockChange>, ServiceError> {
    if !product.tracks_stock() {
        return Ok(None);
    }

    let result = product::Entity::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(product::Column::Id.eq(product.id))
        .filter(product::Column::Stock.gte(quantity))
        .exec(db)
        .await
        .map_err(|e| {
            error!("Failed to decrement stock for product {}: {}", product.id, e);
            ServiceError::DatabaseError(e)
        })?;

    if result.rows_affected == 0 {
        return Err(ServiceError::InsufficientStock(format!(
            "Insufficient stock for {}",
            product.name
        )));
    }

    let new_stock = product::Entity::find_by_id(product.id)
        .one(db)
        .await?
        .map(|p| p.stock)
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product.id)))?;

    let change = StockChange {
        product_id: product.id,
        old_stock: new_stock + quantity,
        new_stock,
    };
    debug!(?change, "stock decremented");
    Ok(Some(change))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10, 5, Some(StockAlertLevel::LowStock))]
    #[case(6, 2, Some(StockAlertLevel::LowStock))]
    #[case(5, 4, None)]
    #[case(3, 0, Some(StockAlertLevel::OutOfStock))]
    #[case(9, 0, Some(StockAlertLevel::OutOfStock))]
    #[case(20, 12, None)]
    fn alerts_only_on_crossing(
        #[case] old: i32,
        #[case] new: i32,
        #[case] expected: Option<StockAlertLevel>,
    ) {
        assert_eq!(crossing_alert(old, new), expected);
    }
}
