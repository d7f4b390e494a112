//! Payment provider adapters and the order-side bookkeeping they share.
//!
//! Both adapters record outcomes through [`record_success`] and [`record_failure`], which write the
//! order change and its outbox event in one transaction and never touch an order whose payment
//! is already settled (paid or refunded).

pub mod esewa;
pub mod khalti;

use crate::auth::AuthUser;
use crate::entities::order::{
    self, OrderStatus, PaymentMethod, PaymentStatus, SETTLED_PAYMENT_STATUSES,
};
use crate::errors::ServiceError;
use crate::events::{outbox, Event, OrderRef};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub use esewa::EsewaGateway;
pub use khalti::KhaltiGateway;

/// Shared HTTP client for provider calls. Every request inherits `timeout`.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {e}")))
}

/// Timeouts stay retryable; anything else is a failed upstream call.
pub(crate) fn provider_error(provider: &str, err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        warn!(provider, "payment provider call timed out");
        ServiceError::ProviderTimeout(provider.to_string())
    } else {
        error!(provider, error = %err, "payment provider call failed");
        ServiceError::ExternalServiceError(format!("{provider}: {err}"))
    }
}

/// Accepts either the order's UUID or its public order code.
pub(crate) async fn find_order_by_reference(
    db: &DatabaseConnection,
    reference: &str,
) -> Result<order::Model, ServiceError> {
    let reference = reference.trim();
    let found = match Uuid::parse_str(reference) {
        Ok(id) => order::Entity::find_by_id(id).one(db).await?,
        Err(_) => {
            order::Entity::find()
                .filter(order::Column::OrderCode.eq(reference))
                .one(db)
                .await?
        }
    };
    found.ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))
}

pub(crate) fn audit_record(provider: PaymentMethod, outcome: &str, detail: Value) -> Value {
    json!({
        "provider": provider.to_string(),
        "outcome": outcome,
        "recordedAt": Utc::now(),
        "detail": detail,
    })
}

/// Marks the payment failed, stores the audit payload and queues `PaymentFailed`.
/// Returns `false` when the payment was already settled and nothing changed.
pub(crate) async fn record_failure(
    db: &DatabaseConnection,
    order: &order::Model,
    provider: PaymentMethod,
    reason: &str,
    raw: Value,
) -> Result<bool, ServiceError> {
    let txn = db.begin().await?;
    let result = order::Entity::update_many()
        .set(order::ActiveModel {
            payment_status: Set(PaymentStatus::Failed),
            payment_details: Set(Some(audit_record(
                provider,
                "failed",
                json!({ "reason": reason, "payload": raw }),
            ))),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::PaymentStatus.is_not_in(SETTLED_PAYMENT_STATUSES))
        .exec(&txn)
        .await?;

    if result.rows_affected == 0 {
        txn.rollback().await?;
        info!(order_code = %order.order_code, "ignoring payment failure for settled order");
        return Ok(false);
    }

    outbox::enqueue(
        &txn,
        &Event::PaymentFailed {
            order: OrderRef::from(order),
            provider,
            amount: order.total,
            reason: reason.to_string(),
        },
    )
    .await?;
    txn.commit().await?;

    warn!(order_code = %order.order_code, %provider, reason, "payment marked failed");
    Ok(true)
}

/// Stores provider output for audit without moving `payment_status`.
pub(crate) async fn record_audit(
    db: &DatabaseConnection,
    order: &order::Model,
    provider: PaymentMethod,
    outcome: &str,
    raw: Value,
) -> Result<(), ServiceError> {
    order::Entity::update_many()
        .set(order::ActiveModel {
            payment_details: Set(Some(audit_record(provider, outcome, raw))),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::PaymentStatus.is_not_in(SETTLED_PAYMENT_STATUSES))
        .exec(db)
        .await?;
    Ok(())
}

/// Provider-specific columns written alongside a successful payment.
#[derive(Debug, Default)]
pub(crate) struct PaidChanges {
    pub reference: Option<String>,
    pub esewa_ref_id: Option<String>,
    pub details: Value,
    /// Fulfillment status to move to, applied only if the order is still in `from` status.
    pub advance: Option<(OrderStatus, OrderStatus)>,
}

/// Marks the order paid and queues `PaymentSucceeded` (plus `OrderStatusChanged` when advanced).
///
/// A payment captured for an order that was cancelled while it was in flight is recorded as
/// `refunded` and handed to the refund workflow with `RefundRequested`.
/// Returns `false` when a concurrent request already settled the payment or moved the order.
pub(crate) async fn record_success(
    db: &DatabaseConnection,
    order: &order::Model,
    provider: PaymentMethod,
    changes: PaidChanges,
) -> Result<bool, ServiceError> {
    let now = Utc::now();
    let cancelled = order.status == OrderStatus::Cancelled;
    let (payment_status, outcome) = if cancelled {
        (PaymentStatus::Refunded, "refund_pending")
    } else {
        (PaymentStatus::Paid, "paid")
    };
    let mut update = order::ActiveModel {
        payment_status: Set(payment_status),
        paid_at: Set(Some(now)),
        payment_details: Set(Some(audit_record(provider, outcome, changes.details))),
        updated_at: Set(now),
        ..Default::default()
    };
    if let Some(ref_id) = &changes.esewa_ref_id {
        update.esewa_ref_id = Set(Some(ref_id.clone()));
    }
    let advance = changes
        .advance
        .filter(|(from, _)| !cancelled && order.status == *from);
    if let Some((_, to)) = advance {
        update.status = Set(to);
    }

    let txn = db.begin().await?;
    let result = order::Entity::update_many()
        .set(update)
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Status.eq(order.status))
        .filter(order::Column::PaymentStatus.is_not_in(SETTLED_PAYMENT_STATUSES))
        .exec(&txn)
        .await?;
    if result.rows_affected == 0 {
        txn.rollback().await?;
        return Ok(false);
    }

    let order_ref = OrderRef::from(order);
    outbox::enqueue(
        &txn,
        &Event::PaymentSucceeded {
            order: order_ref.clone(),
            provider,
            amount: order.total,
            reference: changes.reference,
        },
    )
    .await?;
    if let Some((from, to)) = advance {
        outbox::enqueue(
            &txn,
            &Event::OrderStatusChanged {
                order: order_ref.clone(),
                old_status: from,
                new_status: to,
            },
        )
        .await?;
    }
    if cancelled {
        outbox::enqueue(
            &txn,
            &Event::RefundRequested {
                order: order_ref,
                provider,
                amount: order.total,
            },
        )
        .await?;
    }
    txn.commit().await?;

    if cancelled {
        warn!(order_code = %order.order_code, %provider, amount = %order.total, "payment captured for cancelled order; refund requested");
    } else {
        info!(order_code = %order.order_code, %provider, amount = %order.total, "payment recorded");
    }
    Ok(true)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    /// Public order code.
    pub order_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub total: Decimal,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub khalti_transaction_id: Option<String>,
    pub esewa_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TransactionList {
    pub transactions: Vec<TransactionSummary>,
}

/// Online-payment orders placed by the calling customer, newest first.
pub async fn list_transactions(
    db: &DatabaseConnection,
    actor: &AuthUser,
) -> Result<TransactionList, ServiceError> {
    if !actor.is_customer() {
        return Err(ServiceError::Forbidden("Access denied".to_string()));
    }
    let orders = order::Entity::find()
        .filter(order::Column::CustomerId.eq(actor.user_id))
        .filter(
            order::Column::PaymentMethod.is_in([PaymentMethod::Khalti, PaymentMethod::Esewa]),
        )
        .order_by_desc(order::Column::CreatedAt)
        .all(db)
        .await?;

    Ok(TransactionList {
        transactions: orders
            .into_iter()
            .map(|o| TransactionSummary {
                order_id: o.order_code,
                total: o.total,
                payment_method: o.payment_method,
                payment_status: o.payment_status,
                khalti_transaction_id: o.khalti_transaction_id,
                esewa_transaction_id: o.esewa_transaction_id,
                created_at: o.created_at,
            })
            .collect(),
    })
}

/// Both provider gateways plus the connection they write through.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    pub khalti: KhaltiGateway,
    pub esewa: EsewaGateway,
}

impl PaymentService {
    pub fn new(db: Arc<DatabaseConnection>, khalti: KhaltiGateway, esewa: EsewaGateway) -> Self {
        Self { db, khalti, esewa }
    }

    pub async fn transactions(&self, actor: &AuthUser) -> Result<TransactionList, ServiceError> {
        list_transactions(&self.db, actor).await
    }
}
