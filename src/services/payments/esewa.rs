use super::{
    find_order_by_reference, provider_error, record_audit, record_failure, record_success,
    PaidChanges,
};
use crate::auth::AuthUser;
use crate::config::EsewaConfig;
use crate::entities::order::{self, OrderStatus, PaymentMethod, PaymentStatus};
use crate::errors::{FieldError, ServiceError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use url::Url;
use utoipa::ToSchema;
use validator::Validate;

type HmacSha256 = Hmac<Sha256>;

/// Largest callback/order total difference still treated as equal.
pub const AMOUNT_TOLERANCE: Decimal = dec!(0.01);

static RESPONSE_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<response_code>\s*([^<]+?)\s*</response_code>").expect("response code pattern compiles")
});

/// Canonical string eSewa signs: total, transaction id and product code.
pub fn signature_message(total_amount: &str, transaction_uuid: &str, product_code: &str) -> String {
    format!("total_amount={total_amount},transaction_uuid={transaction_uuid},product_code={product_code}")
}

/// Base64 HMAC-SHA256 of `message` under `secret`.
pub fn sign(secret: &str, message: &str) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid eSewa key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a base64 signature.
pub fn verify_signature(secret: &str, message: &str, signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Formats money the way eSewa expects it in form fields.
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

/// `ORDER-{order code}-{millis}-{random}`.
pub fn generate_transaction_id(order_code: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("ORDER-{}-{}-{}", order_code, Utc::now().timestamp_millis(), suffix)
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct EsewaInitiateRequest {
    /// Order UUID or order code.
    #[validate(length(min = 1, message = "Order ID is required"))]
    pub order_id: String,
}

/// Form fields posted to `epay/main`. Names are fixed by eSewa; every value is a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EsewaFormData {
    pub amt: String,
    pub psc: String,
    pub pdc: String,
    #[serde(rename = "txAmt")]
    pub tx_amt: String,
    #[serde(rename = "tAmt")]
    pub t_amt: String,
    pub pid: String,
    pub scd: String,
    pub su: String,
    pub fu: String,
    pub signature: String,
}

impl EsewaFormData {
    fn pairs(&self) -> [(&'static str, &str); 10] {
        [
            ("amt", self.amt.as_str()),
            ("psc", self.psc.as_str()),
            ("pdc", self.pdc.as_str()),
            ("txAmt", self.tx_amt.as_str()),
            ("tAmt", self.t_amt.as_str()),
            ("pid", self.pid.as_str()),
            ("scd", self.scd.as_str()),
            ("su", self.su.as_str()),
            ("fu", self.fu.as_str()),
            ("signature", self.signature.as_str()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EsewaInitiation {
    pub payment_url: String,
    pub transaction_id: String,
    /// Public order code.
    pub order_id: String,
    pub form_data: EsewaFormData,
}

/// Parsed webhook body.
#[derive(Debug, Clone, PartialEq)]
pub struct EsewaCallback {
    pub oid: String,
    pub amt: Decimal,
    pub ref_id: String,
    pub signature: Option<String>,
}

fn field_as_string(raw: &Map<String, Value>, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl EsewaCallback {
    /// Pulls `oid`, `amt`, `refId` and `signature` out of a JSON or form body.
    pub fn from_payload(raw: &Value) -> Result<Self, ServiceError> {
        let empty = Map::new();
        let fields = raw.as_object().unwrap_or(&empty);

        let oid = field_as_string(fields, "oid");
        let amt = field_as_string(fields, "amt");
        let ref_id = field_as_string(fields, "refId");

        let mut errors = Vec::new();
        if oid.is_none() {
            errors.push(FieldError::new("oid", "Transaction ID is required"));
        }
        let amount = match amt.as_deref().map(Decimal::from_str) {
            None => {
                errors.push(FieldError::new("amt", "Amount is required"));
                None
            }
            Some(Err(_)) => {
                errors.push(FieldError::new("amt", "Amount must be numeric"));
                None
            }
            Some(Ok(value)) => Some(value),
        };
        if ref_id.is_none() {
            errors.push(FieldError::new("refId", "Reference ID is required"));
        }

        match (oid, amount, ref_id) {
            (Some(oid), Some(amt), Some(ref_id)) if errors.is_empty() => Ok(Self {
                oid,
                amt,
                ref_id,
                signature: field_as_string(fields, "signature"),
            }),
            _ => Err(ServiceError::StructuralInvalid(errors)),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EsewaWebhookAck {
    pub order_id: String,
    pub transaction_id: String,
    pub ref_id: String,
    /// True when the callback repeated an already-settled payment.
    pub already_processed: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EsewaPaymentStatus {
    pub payment_status: PaymentStatus,
    pub order_id: String,
    pub transaction_id: Option<String>,
    pub esewa_ref_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Query string eSewa appends to the browser redirect.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EsewaRedirectQuery {
    pub oid: Option<String>,
    pub amt: Option<String>,
    #[serde(rename = "refId")]
    pub ref_id: Option<String>,
}

/// Outcome of `epay/transrec`, carrying the raw response body.
enum Verification {
    Confirmed(String),
    Rejected(String),
}

#[derive(Clone)]
pub struct EsewaGateway {
    db: Arc<DatabaseConnection>,
    http: reqwest::Client,
    config: EsewaConfig,
    frontend_url: String,
}

impl EsewaGateway {
    pub fn new(
        db: Arc<DatabaseConnection>,
        http: reqwest::Client,
        config: EsewaConfig,
        frontend_url: String,
    ) -> Self {
        Self {
            db,
            http,
            config,
            frontend_url,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// Builds the signed eSewa form for an order and marks its payment processing.
    pub fn build_form(
        &self,
        order: &order::Model,
        transaction_id: &str,
    ) -> Result<EsewaFormData, ServiceError> {
        let t_amt = format_amount(order.total);
        let signature = sign(
            &self.config.secret_key,
            &signature_message(&t_amt, transaction_id, &self.config.merchant_id),
        )?;
        Ok(EsewaFormData {
            amt: format_amount(order.subtotal - order.discount),
            psc: "0".to_string(),
            pdc: format_amount(order.delivery_fee),
            tx_amt: "0".to_string(),
            t_amt,
            pid: transaction_id.to_string(),
            scd: self.config.merchant_id.clone(),
            su: self.config.success_url.clone(),
            fu: self.config.failure_url.clone(),
            signature,
        })
    }

    #[instrument(skip(self, request), fields(customer_id = %actor.user_id, order = %request.order_id))]
    pub async fn initiate(
        &self,
        actor: &AuthUser,
        request: EsewaInitiateRequest,
    ) -> Result<EsewaInitiation, ServiceError> {
        if !actor.is_customer() {
            return Err(ServiceError::Forbidden("Access denied".to_string()));
        }
        let order = find_order_by_reference(&self.db, &request.order_id).await?;
        if order.customer_id != actor.user_id {
            return Err(ServiceError::Forbidden("Access denied".to_string()));
        }
        if order.payment_method != PaymentMethod::Esewa {
            return Err(ServiceError::ValidationError(
                "Order payment method is not eSewa".to_string(),
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

        let transaction_id = generate_transaction_id(&order.order_code);
        let form = self.build_form(&order, &transaction_id)?;
        let payment_url = Url::parse_with_params(&self.api("epay/main"), form.pairs())
            .map_err(|e| ServiceError::InternalError(format!("invalid eSewa URL: {e}")))?;

        let result = order::Entity::update_many()
            .set(order::ActiveModel {
                esewa_transaction_id: Set(Some(transaction_id.clone())),
                payment_status: Set(PaymentStatus::Processing),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::PaymentStatus.ne(PaymentStatus::Paid))
            .exec(&*self.db)
            .await
            .map_err(|e| ServiceError::from_write(e, "eSewa transaction id collision, please retry"))?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ValidationError(
                "Order is already paid".to_string(),
            ));
        }

        info!(order_code = %order.order_code, %transaction_id, "esewa payment initiated");
        Ok(EsewaInitiation {
            payment_url: payment_url.to_string(),
            transaction_id,
            order_id: order.order_code,
            form_data: form,
        })
    }

    /// Authenticates a provider callback and settles the order.
    #[instrument(skip(self, raw))]
    pub async fn reconcile(&self, raw: Value) -> Result<EsewaWebhookAck, ServiceError> {
        let callback = EsewaCallback::from_payload(&raw)?;

        let order = order::Entity::find()
            .filter(order::Column::EsewaTransactionId.eq(callback.oid.as_str()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                warn!(oid = %callback.oid, "esewa callback for unknown transaction");
                ServiceError::NotFound("Order not found".to_string())
            })?;

        let t_amt = format_amount(callback.amt);
        let message = signature_message(&t_amt, &callback.oid, &self.config.merchant_id);
        let signed = callback
            .signature
            .as_deref()
            .is_some_and(|s| verify_signature(&self.config.secret_key, &message, s));
        if !signed {
            error!(oid = %callback.oid, "invalid esewa signature");
            return self.reject(&order, "Invalid payment signature", raw).await;
        }

        if (callback.amt - order.total).abs() > AMOUNT_TOLERANCE {
            error!(oid = %callback.oid, expected = %order.total, received = %callback.amt, "esewa amount mismatch");
            return self.reject(&order, "Payment amount mismatch", raw).await;
        }

        let mut verification = Value::Null;
        if self.config.verify_with_provider && !order.payment_status.is_settled() {
            match self.confirm_with_provider(&callback).await {
                Ok(Verification::Confirmed(body)) => verification = json!(body),
                Ok(Verification::Rejected(body)) => {
                    error!(oid = %callback.oid, "esewa verification rejected the transaction");
                    let audit = json!({ "callback": raw, "verification": body });
                    return self.reject(&order, "Payment verification failed", audit).await;
                }
                Err(err) => {
                    record_audit(
                        &self.db,
                        &order,
                        PaymentMethod::Esewa,
                        "verification_unavailable",
                        json!({ "callback": raw, "error": err.to_string() }),
                    )
                    .await?;
                    return Err(err);
                }
            }
        }

        let ack = |already_processed: bool| EsewaWebhookAck {
            order_id: order.order_code.clone(),
            transaction_id: callback.oid.clone(),
            ref_id: callback.ref_id.clone(),
            already_processed,
        };

        if order.payment_status.is_settled() {
            info!(order_code = %order.order_code, "esewa callback already processed");
            return Ok(ack(true));
        }

        let applied = record_success(
            &self.db,
            &order,
            PaymentMethod::Esewa,
            PaidChanges {
                reference: Some(callback.ref_id.clone()),
                esewa_ref_id: Some(callback.ref_id.clone()),
                details: json!({ "callback": raw, "verification": verification, "verified": true }),
                advance: Some((OrderStatus::Pending, OrderStatus::Preparing)),
            },
        )
        .await?;

        if !applied {
            let current = order::Entity::find_by_id(order.id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
            if current.payment_status.is_settled() {
                return Ok(ack(true));
            }
            return Err(ServiceError::Conflict(
                "Order was modified concurrently; retry the callback".to_string(),
            ));
        }
        Ok(ack(false))
    }

    async fn reject(
        &self,
        order: &order::Model,
        reason: &str,
        raw: Value,
    ) -> Result<EsewaWebhookAck, ServiceError> {
        record_failure(&self.db, order, PaymentMethod::Esewa, reason, raw).await?;
        Err(ServiceError::PaymentRejected(reason.to_string()))
    }

    /// Server-to-server lookup against `epay/transrec`.
    async fn confirm_with_provider(
        &self,
        callback: &EsewaCallback,
    ) -> Result<Verification, ServiceError> {
        let amount = format_amount(callback.amt);
        let form = [
            ("amt", amount.as_str()),
            ("rid", callback.ref_id.as_str()),
            ("pid", callback.oid.as_str()),
            ("scd", self.config.merchant_id.as_str()),
        ];
        let response = self
            .http
            .post(self.api("epay/transrec"))
            .form(&form)
            .send()
            .await
            .map_err(|e| provider_error("esewa", e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| provider_error("esewa", e))?;
        if status.is_server_error() {
            return Err(ServiceError::ExternalServiceError(format!(
                "esewa verification returned {status}"
            )));
        }

        let code = RESPONSE_CODE_RE
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str());
        if code == Some("Success") {
            Ok(Verification::Confirmed(body))
        } else {
            Ok(Verification::Rejected(body))
        }
    }

    /// Owner-only snapshot of an eSewa payment.
    pub async fn payment_status(
        &self,
        actor: &AuthUser,
        transaction_id: &str,
    ) -> Result<EsewaPaymentStatus, ServiceError> {
        let order = order::Entity::find()
            .filter(order::Column::EsewaTransactionId.eq(transaction_id.trim()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
        if order.customer_id != actor.user_id {
            return Err(ServiceError::Forbidden("Access denied".to_string()));
        }
        Ok(EsewaPaymentStatus {
            payment_status: order.payment_status,
            order_id: order.order_code,
            transaction_id: order.esewa_transaction_id,
            esewa_ref_id: order.esewa_ref_id,
            paid_at: order.paid_at,
        })
    }

    fn checkout_url(&self, outcome: &str, params: &[(&str, &str)]) -> String {
        let base = format!("{}/checkout/{}", self.frontend_url.trim_end_matches('/'), outcome);
        match Url::parse_with_params(&base, params) {
            Ok(url) => url.to_string(),
            Err(e) => {
                error!(error = %e, "invalid frontend url");
                base
            }
        }
    }

    /// Where to send the browser after eSewa's success redirect. Never settles payment;
    /// the webhook does that.
    pub async fn success_redirect(&self, query: EsewaRedirectQuery) -> String {
        let Some(oid) = query.oid.filter(|o| !o.trim().is_empty()) else {
            return self.checkout_url("failure", &[("error", "missing_parameters")]);
        };
        let found = order::Entity::find()
            .filter(order::Column::EsewaTransactionId.eq(oid.as_str()))
            .one(&*self.db)
            .await;
        match found {
            Ok(Some(order)) if order.payment_status == PaymentStatus::Paid => {
                self.checkout_url("success", &[("orderId", order.order_code.as_str())])
            }
            Ok(Some(order)) => self.checkout_url(
                "success",
                &[("orderId", order.order_code.as_str()), ("transactionId", oid.as_str())],
            ),
            Ok(None) => self.checkout_url("failure", &[("error", "order_not_found")]),
            Err(e) => {
                error!(error = %e, "esewa success redirect failed");
                self.checkout_url("failure", &[("error", "server_error")])
            }
        }
    }

    /// Records an abandoned or declined eSewa payment and picks the failure page.
    pub async fn failure_redirect(&self, query: EsewaRedirectQuery) -> String {
        match self.record_redirect_failure(&query).await {
            Ok(Some(order_code)) => self.checkout_url(
                "failure",
                &[("orderId", order_code.as_str()), ("error", "payment_failed")],
            ),
            Ok(None) => self.checkout_url("failure", &[("error", "payment_failed")]),
            Err(e) => {
                error!(error = %e, "esewa failure redirect failed");
                self.checkout_url("failure", &[("error", "server_error")])
            }
        }
    }

    async fn record_redirect_failure(
        &self,
        query: &EsewaRedirectQuery,
    ) -> Result<Option<String>, ServiceError> {
        let Some(oid) = query.oid.as_deref().filter(|o| !o.trim().is_empty()) else {
            return Ok(None);
        };
        let Some(order) = order::Entity::find()
            .filter(order::Column::EsewaTransactionId.eq(oid))
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };
        if !order.payment_status.is_settled() {
            let raw = serde_json::to_value(query)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?;
            record_failure(
                &self.db,
                &order,
                PaymentMethod::Esewa,
                "Payment cancelled or declined at eSewa",
                json!({ "failure": true, "query": raw }),
            )
            .await?;
        }
        Ok(Some(order.order_code))
    }
}
