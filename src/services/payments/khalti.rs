use super::{find_order_by_reference, provider_error, record_failure, record_success, PaidChanges};
use crate::auth::AuthUser;
use crate::config::KhaltiConfig;
use crate::entities::order::{self, OrderStatus, PaymentMethod, PaymentStatus};
use crate::entities::order_item;
use crate::errors::ServiceError;
use crate::services::orders::OrderView;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

/// Lookup status Khalti reports for a settled payment.
pub const COMPLETED: &str = "Completed";

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct KhaltiInitiateRequest {
    /// Order UUID or order code.
    #[validate(length(min = 1, message = "Order ID is required"))]
    pub order_id: String,
    /// Optional; when present it must equal the order total.
    #[schema(value_type = Option<f64>)]
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KhaltiInitiation {
    pub payment_url: String,
    pub pidx: String,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(default)]
pub struct KhaltiVerifyRequest {
    #[validate(length(min = 1, message = "Payment ID is required"))]
    pub pidx: String,
}

/// Body of Khalti's `epayment/lookup` response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KhaltiLookup {
    pub pidx: String,
    /// Paisa.
    pub total_amount: i64,
    pub status: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub fee: Option<i64>,
    #[serde(default)]
    pub refunded: Option<bool>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KhaltiVerification {
    pub order: OrderView,
    pub payment: KhaltiLookup,
}

#[derive(Debug, Serialize)]
struct InitiatePayload<'a> {
    return_url: &'a str,
    website_url: &'a str,
    amount: i64,
    purchase_order_id: &'a str,
    purchase_order_name: String,
}

#[derive(Debug, Serialize)]
struct LookupPayload<'a> {
    pidx: &'a str,
}

/// Rupees to paisa.
pub fn to_paisa(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::InternalError(format!("amount {amount} out of range")))
}

#[derive(Clone)]
pub struct KhaltiGateway {
    db: Arc<DatabaseConnection>,
    http: reqwest::Client,
    config: KhaltiConfig,
}

impl KhaltiGateway {
    pub fn new(db: Arc<DatabaseConnection>, http: reqwest::Client, config: KhaltiConfig) -> Self {
        Self { db, http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Opens a Khalti payment session for the caller's order and stores its `pidx`.
    #[instrument(skip(self, request), fields(customer_id = %actor.user_id, order = %request.order_id))]
    pub async fn initiate(
        &self,
        actor: &AuthUser,
        request: KhaltiInitiateRequest,
    ) -> Result<KhaltiInitiation, ServiceError> {
        if !actor.is_customer() {
            return Err(ServiceError::Forbidden("Access denied".to_string()));
        }
        let order = find_order_by_reference(&self.db, &request.order_id).await?;
        if order.customer_id != actor.user_id {
            return Err(ServiceError::Forbidden("Access denied".to_string()));
        }
        if order.payment_method != PaymentMethod::Khalti {
            return Err(ServiceError::ValidationError(
                "Order is not set up for Khalti payment".to_string(),
            ));
        }
        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::ValidationError(
                "Order is already paid".to_string(),
            ));
        }
        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::ValidationError(
                "Cannot pay for a cancelled order".to_string(),
            ));
        }
        if let Some(amount) = request.amount {
            if amount.round_dp(2) != order.total {
                return Err(ServiceError::ValidationError(
                    "Payment amount does not match order total".to_string(),
                ));
            }
        }

        let payload = InitiatePayload {
            return_url: &self.config.return_url,
            website_url: &self.config.website_url,
            amount: to_paisa(order.total)?,
            purchase_order_id: &order.order_code,
            purchase_order_name: format!("Order {}", order.order_code),
        };
        let response = self
            .http
            .post(self.endpoint("epayment/initiate/"))
            .header("Authorization", format!("Key {}", self.config.secret_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| provider_error("khalti", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "khalti rejected payment initiation");
            return Err(ServiceError::ExternalServiceError(format!(
                "khalti initiate returned {status}"
            )));
        }
        let session: KhaltiInitiation = response
            .json()
            .await
            .map_err(|e| provider_error("khalti", e))?;

        order::Entity::update_many()
            .set(order::ActiveModel {
                khalti_transaction_id: Set(Some(session.pidx.clone())),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .exec(&*self.db)
            .await
            .map_err(|e| ServiceError::from_write(e, "Payment session already linked to another order"))?;

        info!(order_code = %order.order_code, pidx = %session.pidx, "khalti payment initiated");
        Ok(session)
    }

    /// Pulls the payment state from Khalti and settles the order on completion.
    #[instrument(skip(self, request), fields(user_id = %actor.user_id, pidx = %request.pidx))]
    pub async fn verify(
        &self,
        actor: &AuthUser,
        request: KhaltiVerifyRequest,
    ) -> Result<KhaltiVerification, ServiceError> {
        let pidx = request.pidx.trim();
        let order = order::Entity::find()
            .filter(order::Column::KhaltiTransactionId.eq(pidx))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
        if !actor.is_admin() && order.customer_id != actor.user_id {
            return Err(ServiceError::Forbidden("Access denied".to_string()));
        }

        let response = self
            .http
            .post(self.endpoint("epayment/lookup/"))
            .header("Authorization", format!("Key {}", self.config.secret_key))
            .json(&LookupPayload { pidx })
            .send()
            .await
            .map_err(|e| provider_error("khalti", e))?;
        if !response.status().is_success() {
            let status = response.status();
            error!(%status, "khalti lookup failed");
            return Err(ServiceError::ExternalServiceError(format!(
                "khalti lookup returned {status}"
            )));
        }
        let lookup: KhaltiLookup = response
            .json()
            .await
            .map_err(|e| provider_error("khalti", e))?;

        if lookup.status != COMPLETED {
            return Err(ServiceError::PaymentRejected(format!(
                "Payment not completed (status: {})",
                lookup.status
            )));
        }
        if order.payment_status.is_settled() {
            return self.verification(order, lookup).await;
        }

        let raw = serde_json::to_value(&lookup)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        if lookup.total_amount != to_paisa(order.total)? {
            warn!(
                order_code = %order.order_code,
                expected = %order.total,
                paid_paisa = lookup.total_amount,
                "khalti amount mismatch"
            );
            record_failure(&self.db, &order, PaymentMethod::Khalti, "Payment amount mismatch", raw)
                .await?;
            return Err(ServiceError::PaymentRejected(
                "Payment amount mismatch".to_string(),
            ));
        }

        let applied = record_success(
            &self.db,
            &order,
            PaymentMethod::Khalti,
            PaidChanges {
                reference: lookup.transaction_id.clone(),
                details: raw,
                ..Default::default()
            },
        )
        .await?;

        let current = order::Entity::find_by_id(order.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
        if !applied && !current.payment_status.is_settled() {
            warn!(order_code = %current.order_code, "khalti settlement lost a concurrent update");
            return Err(ServiceError::Conflict(
                "Order was modified concurrently; verify again".to_string(),
            ));
        }
        self.verification(current, lookup).await
    }

    async fn verification(
        &self,
        order: order::Model,
        lookup: KhaltiLookup,
    ) -> Result<KhaltiVerification, ServiceError> {
        let items = order.find_related(order_item::Entity).all(&*self.db).await?;
        Ok(KhaltiVerification {
            order: OrderView::from_parts(order, items),
            payment: lookup,
        })
    }
}
