use crate::config::DeliveryConfig;
use crate::entities::admin_setting::{self, DELIVERY_FEE, DELIVERY_FREE_THRESHOLD};
use crate::errors::ServiceError;
use crate::services::pricing::DeliveryFeeSchedule;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Runtime-adjustable settings backed by `admin_settings`.
#[derive(Clone)]
pub struct SettingsService {
    db: Arc<DatabaseConnection>,
    defaults: DeliveryFeeSchedule,
}

impl SettingsService {
    pub fn new(db: Arc<DatabaseConnection>, defaults: &DeliveryConfig) -> Self {
        Self {
            db,
            defaults: DeliveryFeeSchedule {
                free_threshold: defaults.free_threshold,
                fee: defaults.fee,
            },
        }
    }

    /// Current schedule; each missing or unusable value falls back to the configured default.
    #[instrument(skip(self))]
    pub async fn delivery_fee_schedule(&self) -> Result<DeliveryFeeSchedule, ServiceError> {
        let rows = admin_setting::Entity::find()
            .filter(admin_setting::Column::Key.is_in([DELIVERY_FREE_THRESHOLD, DELIVERY_FEE]))
            .all(&*self.db)
            .await?;

        let lookup = |key: &str, fallback: Decimal| {
            rows.iter()
                .find(|row| row.key == key)
                .and_then(|row| match Decimal::from_str(row.value.trim()) {
                    Ok(v) if !v.is_sign_negative() => Some(v),
                    _ => {
                        warn!(key, value = %row.value, "ignoring unusable delivery setting");
                        None
                    }
                })
                .unwrap_or(fallback)
        };

        Ok(DeliveryFeeSchedule {
            free_threshold: lookup(DELIVERY_FREE_THRESHOLD, self.defaults.free_threshold),
            fee: lookup(DELIVERY_FEE, self.defaults.fee),
        })
    }

    /// Seeds missing delivery keys with the configured defaults. Existing values are kept.
    pub async fn init_delivery_fee_settings(&self) -> Result<(), ServiceError> {
        let seeds = [
            (
                DELIVERY_FREE_THRESHOLD,
                self.defaults.free_threshold,
                "Order amount above which delivery is free",
            ),
            (DELIVERY_FEE, self.defaults.fee, "Flat delivery fee"),
        ];

        for (key, value, description) in seeds {
            let existing = admin_setting::Entity::find_by_id(key.to_string())
                .one(&*self.db)
                .await?;
            if existing.is_some() {
                continue;
            }
            admin_setting::ActiveModel {
                key: Set(key.to_string()),
                value: Set(value.to_string()),
                description: Set(Some(description.to_string())),
                updated_at: Set(Utc::now()),
            }
            .insert(&*self.db)
            .await?;
            info!(key, %value, "seeded delivery fee setting");
        }
        Ok(())
    }

    /// Admin override of the schedule. Omitted values stay as they are.
    #[instrument(skip(self))]
    pub async fn update_delivery_fee_schedule(
        &self,
        free_threshold: Option<Decimal>,
        fee: Option<Decimal>,
    ) -> Result<DeliveryFeeSchedule, ServiceError> {
        if free_threshold.is_some_and(|v| v.is_sign_negative()) {
            return Err(ServiceError::ValidationError(
                "Free delivery threshold must be a non-negative number".to_string(),
            ));
        }
        if fee.is_some_and(|v| v.is_sign_negative()) {
            return Err(ServiceError::ValidationError(
                "Delivery fee must be a non-negative number".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        if let Some(value) = free_threshold {
            upsert(
                &txn,
                DELIVERY_FREE_THRESHOLD,
                value,
                "Order amount above which delivery is free",
            )
            .await?;
        }
        if let Some(value) = fee {
            upsert(&txn, DELIVERY_FEE, value, "Flat delivery fee").await?;
        }
        txn.commit().await?;

        info!(?free_threshold, ?fee, "delivery fee settings updated");
        self.delivery_fee_schedule().await
    }
}

async fn upsert<C: ConnectionTrait>(
    db: &C,
    key: &str,
    value: Decimal,
    description: &str,
) -> Result<(), ServiceError> {
    let row = admin_setting::ActiveModel {
        key: Set(key.to_string()),
        value: Set(value.normalize().to_string()),
        description: Set(Some(description.to_string())),
        updated_at: Set(Utc::now()),
    };
    match admin_setting::Entity::find_by_id(key.to_string()).one(db).await? {
        Some(_) => {
            row.update(db).await?;
        }
        None => {
            row.insert(db).await?;
        }
    }
    Ok(())
}
