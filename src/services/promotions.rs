use crate::auth::AuthUser;
use crate::entities::promo_code::{self, DiscountType, UNLIMITED_USAGE};
use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    EntityTrait, ModelTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Outcome of checking a promo code against an order amount.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PromoValidation {
    pub valid: bool,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub discount: Decimal,
    pub message: String,
    #[serde(skip)]
    pub promo: Option<promo_code::Model>,
}

impl PromoValidation {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            discount: Decimal::ZERO,
            message: message.into(),
            promo: None,
        }
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Deterministic in `(code, promo, order_total, now)`; short-circuits on the first failing rule.
pub fn evaluate(
    code: &str,
    promo: Option<&promo_code::Model>,
    order_total: Decimal,
    now: DateTime<Utc>,
) -> PromoValidation {
    if code.trim().is_empty() {
        return PromoValidation::rejected("Promo code is required");
    }
    let Some(promo) = promo else {
        return PromoValidation::rejected("Invalid promo code");
    };
    if !promo.is_valid_at(now) {
        return PromoValidation::rejected("Promo code is expired or inactive");
    }
    if order_total < promo.min_order_amount {
        return PromoValidation::rejected(format!(
            "Minimum order amount of Rs. {} required",
            promo.min_order_amount.normalize()
        ));
    }

    PromoValidation {
        valid: true,
        discount: promo.discount_for(order_total),
        message: "Promo code applied successfully".to_string(),
        promo: Some(promo.clone()),
    }
}

fn negative_rejected(value: &Decimal, message: &'static str) -> Result<(), ValidationError> {
    if value.is_sign_negative() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some(message.into());
        return Err(err);
    }
    Ok(())
}

fn validate_order_total(value: &Decimal) -> Result<(), ValidationError> {
    negative_rejected(value, "Valid order total is required")
}

fn validate_amount(value: &Decimal) -> Result<(), ValidationError> {
    negative_rejected(value, "Amount must be non-negative")
}

fn validate_usage_limit(value: i32) -> Result<(), ValidationError> {
    if value < UNLIMITED_USAGE {
        let mut err = ValidationError::new("usage_limit");
        err.message = Some("Usage limit must be -1 (unlimited) or greater".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidatePromoRequest {
    #[validate(length(min = 1, message = "Promo code is required"))]
    pub code: String,
    #[validate(required, custom = "validate_order_total")]
    #[schema(value_type = f64)]
    pub order_total: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePromoCodeRequest {
    #[validate(length(min = 1, max = 32, message = "Promo code is required"))]
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    #[validate(custom = "validate_amount")]
    #[schema(value_type = f64)]
    pub discount_value: Decimal,
    #[serde(default)]
    #[validate(custom = "validate_amount")]
    #[schema(value_type = f64)]
    pub min_order_amount: Decimal,
    #[schema(value_type = Option<f64>)]
    pub max_discount: Option<Decimal>,
    /// `-1` for unlimited.
    #[validate(custom = "validate_usage_limit")]
    pub usage_limit: Option<i32>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdatePromoCodeRequest {
    #[validate(length(min = 1, max = 32, message = "Promo code cannot be empty"))]
    pub code: Option<String>,
    pub description: Option<String>,
    pub discount_type: Option<DiscountType>,
    #[validate(custom = "validate_amount")]
    #[schema(value_type = Option<f64>)]
    pub discount_value: Option<Decimal>,
    #[validate(custom = "validate_amount")]
    #[schema(value_type = Option<f64>)]
    pub min_order_amount: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub max_discount: Option<Decimal>,
    #[validate(custom = "validate_usage_limit")]
    pub usage_limit: Option<i32>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromoCodeView {
    pub id: Uuid,
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub discount_value: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub min_order_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float_option")]
    #[schema(value_type = Option<f64>)]
    pub max_discount: Option<Decimal>,
    pub usage_limit: i32,
    pub used_count: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
}

impl From<promo_code::Model> for PromoCodeView {
    fn from(m: promo_code::Model) -> Self {
        Self {
            id: m.id,
            code: m.code,
            description: m.description,
            discount_type: m.discount_type,
            discount_value: m.discount_value,
            min_order_amount: m.min_order_amount,
            max_discount: m.max_discount,
            usage_limit: m.usage_limit,
            used_count: m.used_count,
            valid_from: m.valid_from,
            valid_until: m.valid_until,
            is_active: m.is_active,
        }
    }
}

fn check_window(from: DateTime<Utc>, until: DateTime<Utc>) -> Result<(), ServiceError> {
    if until < from {
        return Err(ServiceError::ValidationError(
            "Valid until must not be before valid from".to_string(),
        ));
    }
    Ok(())
}

fn require_admin(actor: &AuthUser) -> Result<(), ServiceError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Admin access required".to_string()))
    }
}

#[derive(Clone)]
pub struct PromoCodeService {
    db: Arc<DatabaseConnection>,
}

impl PromoCodeService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Looks the code up and evaluates it. Never consumes usage.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        order_total: Decimal,
    ) -> Result<PromoValidation, ServiceError> {
        let normalized = normalize_code(code);
        let promo = if normalized.is_empty() {
            None
        } else {
            promo_code::Entity::find()
                .filter(promo_code::Column::Code.eq(normalized.as_str()))
                .one(&*self.db)
                .await
                .map_err(|e| {
                    error!("Failed to look up promo code {}: {}", normalized, e);
                    ServiceError::DatabaseError(e)
                })?
        };

        Ok(evaluate(&normalized, promo.as_ref(), order_total, Utc::now()))
    }

    /// Codes currently redeemable, newest first.
    pub async fn list_active(&self) -> Result<Vec<PromoCodeView>, ServiceError> {
        let now = Utc::now();
        let codes = promo_code::Entity::find()
            .filter(promo_code::Column::IsActive.eq(true))
            .filter(promo_code::Column::ValidFrom.lte(now))
            .filter(promo_code::Column::ValidUntil.gte(now))
            .order_by_desc(promo_code::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(codes
            .into_iter()
            .filter(|c| c.is_valid_at(now))
            .map(PromoCodeView::from)
            .collect())
    }

    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn create(
        &self,
        actor: &AuthUser,
        request: CreatePromoCodeRequest,
    ) -> Result<PromoCodeView, ServiceError> {
        require_admin(actor)?;
        check_window(request.valid_from, request.valid_until)?;
        let code = normalize_code(&request.code);

        let created = promo_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            description: Set(request.description),
            discount_type: Set(request.discount_type),
            discount_value: Set(request.discount_value),
            min_order_amount: Set(request.min_order_amount),
            max_discount: Set(request.max_discount),
            usage_limit: Set(request.usage_limit.unwrap_or(UNLIMITED_USAGE)),
            used_count: Set(0),
            valid_from: Set(request.valid_from),
            valid_until: Set(request.valid_until),
            is_active: Set(request.is_active.unwrap_or(true)),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| ServiceError::from_write(e, "Promo code already exists"))?;

        info!(%code, "promo code created");
        Ok(created.into())
    }

    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        actor: &AuthUser,
        id: Uuid,
        request: UpdatePromoCodeRequest,
    ) -> Result<PromoCodeView, ServiceError> {
        require_admin(actor)?;
        let existing = promo_code::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Promo code not found".to_string()))?;
        check_window(
            request.valid_from.unwrap_or(existing.valid_from),
            request.valid_until.unwrap_or(existing.valid_until),
        )?;

        let mut active: promo_code::ActiveModel = existing.into();
        if let Some(code) = request.code {
            active.code = Set(normalize_code(&code));
        }
        if let Some(description) = request.description {
            active.description = Set(Some(description));
        }
        if let Some(discount_type) = request.discount_type {
            active.discount_type = Set(discount_type);
        }
        if let Some(value) = request.discount_value {
            active.discount_value = Set(value);
        }
        if let Some(min) = request.min_order_amount {
            active.min_order_amount = Set(min);
        }
        if let Some(cap) = request.max_discount {
            active.max_discount = Set(Some(cap));
        }
        if let Some(limit) = request.usage_limit {
            active.usage_limit = Set(limit);
        }
        if let Some(from) = request.valid_from {
            active.valid_from = Set(from);
        }
        if let Some(until) = request.valid_until {
            active.valid_until = Set(until);
        }
        if let Some(is_active) = request.is_active {
            active.is_active = Set(is_active);
        }

        let updated = active
            .update(&*self.db)
            .await
            .map_err(|e| ServiceError::from_write(e, "Promo code already exists"))?;
        info!(code = %updated.code, "promo code updated");
        Ok(updated.into())
    }

    pub async fn delete(&self, actor: &AuthUser, id: Uuid) -> Result<(), ServiceError> {
        require_admin(actor)?;
        let existing = promo_code::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Promo code not found".to_string()))?;
        let code = existing.code.clone();
        existing.delete(&*self.db).await?;
        info!(%code, "promo code deleted");
        Ok(())
    }
}

/// Consumes one use of a promo code; call inside the order-creation transaction.
/// Fails when a concurrent order took the last remaining use.
pub async fn consume_usage<C: ConnectionTrait>(db: &C, promo_id: Uuid) -> Result<(), ServiceError> {
    let result = promo_code::Entity::update_many()
        .col_expr(
            promo_code::Column::UsedCount,
            Expr::col(promo_code::Column::UsedCount).add(1),
        )
        .filter(promo_code::Column::Id.eq(promo_id))
        .filter(
            Condition::any()
                .add(promo_code::Column::UsageLimit.eq(UNLIMITED_USAGE))
                .add(
                    Expr::col(promo_code::Column::UsedCount)
                        .lt(Expr::col(promo_code::Column::UsageLimit)),
                ),
        )
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        warn!(%promo_id, "promo code exhausted during order creation");
        return Err(ServiceError::ValidationError(
            "Promo code usage limit reached".to_string(),
        ));
    }
    Ok(())
}
