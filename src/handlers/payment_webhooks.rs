use crate::errors::{FieldError, ServiceError};
use crate::services::payments::esewa::{EsewaRedirectQuery, EsewaWebhookAck};
use crate::{ApiResponse, AppState};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap},
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use serde_json::{Map, Value};
use tracing::info;

/// Unauthenticated eSewa endpoints. The webhook is trusted only through its signature.
pub fn esewa_public_routes() -> Router<AppState> {
    Router::new()
        .route("/esewa/webhook", post(esewa_webhook))
        .route("/esewa/success", get(esewa_success))
        .route("/esewa/failure", get(esewa_failure))
}

/// Accepts either a JSON object or an urlencoded form.
pub fn parse_callback_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, ServiceError> {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        let fields: Map<String, Value> = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        return Ok(Value::Object(fields));
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        _ => Err(ServiceError::StructuralInvalid(vec![FieldError::new(
            "body",
            "Expected a JSON object or form body",
        )])),
    }
}

/// eSewa payment callback
#[utoipa::path(
    post,
    path = "/api/v1/payments/esewa/webhook",
    request_body(content = Object, description = "`{oid, amt, refId, signature}` as JSON or form"),
    responses(
        (status = 200, description = "Payment accepted", body = ApiResponse<EsewaWebhookAck>),
        (status = 400, description = "Signature, amount or provider verification failed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown transaction", body = crate::errors::ErrorResponse),
        (status = 422, description = "Missing callback fields", body = crate::errors::ErrorResponse),
        (status = 504, description = "eSewa verification timed out; retry", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn esewa_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<EsewaWebhookAck>>, ServiceError> {
    let raw = parse_callback_body(&headers, &body)?;
    let ack = state.services.payments.esewa.reconcile(raw).await?;
    let message = if ack.already_processed {
        "Payment already processed"
    } else {
        "Payment verified successfully"
    };
    Ok(Json(ApiResponse::with_message(ack, message)))
}

/// Browser return after a completed eSewa checkout
#[utoipa::path(
    get,
    path = "/api/v1/payments/esewa/success",
    params(
        ("oid" = Option<String>, Query, description = "eSewa transaction id"),
        ("amt" = Option<String>, Query, description = "Amount"),
        ("refId" = Option<String>, Query, description = "eSewa reference id"),
    ),
    responses((status = 303, description = "Redirect to the storefront checkout page")),
    tag = "payments"
)]
pub async fn esewa_success(
    State(state): State<AppState>,
    query: Option<Query<EsewaRedirectQuery>>,
) -> Redirect {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let target = state.services.payments.esewa.success_redirect(query).await;
    info!(%target, "esewa success redirect");
    Redirect::to(&target)
}

/// Browser return after a cancelled or failed eSewa checkout
#[utoipa::path(
    get,
    path = "/api/v1/payments/esewa/failure",
    params(
        ("oid" = Option<String>, Query, description = "eSewa transaction id"),
        ("amt" = Option<String>, Query, description = "Amount"),
    ),
    responses((status = 303, description = "Redirect to the storefront failure page")),
    tag = "payments"
)]
pub async fn esewa_failure(
    State(state): State<AppState>,
    query: Option<Query<EsewaRedirectQuery>>,
) -> Redirect {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let target = state.services.payments.esewa.failure_redirect(query).await;
    info!(%target, "esewa failure redirect");
    Redirect::to(&target)
}
