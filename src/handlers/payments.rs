use super::common::ValidatedJson;
use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::payments::esewa::{EsewaInitiateRequest, EsewaInitiation, EsewaPaymentStatus};
use crate::services::payments::khalti::{
    KhaltiInitiateRequest, KhaltiInitiation, KhaltiVerification, KhaltiVerifyRequest,
};
use crate::services::payments::TransactionList;
use crate::{ApiResponse, AppState};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

/// Authenticated payment routes. Provider callbacks live in `payment_webhooks`.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/khalti/initiate", post(initiate_khalti))
        .route("/khalti/verify", post(verify_khalti))
        .route("/esewa/initiate", post(initiate_esewa))
        .route("/esewa/verify/:transaction_id", get(esewa_payment_status))
        .route("/transactions", get(list_transactions))
}

/// Start a Khalti payment for an order
#[utoipa::path(
    post,
    path = "/api/v1/payments/khalti/initiate",
    request_body = KhaltiInitiateRequest,
    responses(
        (status = 200, description = "Khalti session created", body = ApiResponse<KhaltiInitiation>),
        (status = 400, description = "Order not payable with Khalti", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the order's customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Khalti request failed", body = crate::errors::ErrorResponse),
        (status = 504, description = "Khalti timed out", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn initiate_khalti(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(request): ValidatedJson<KhaltiInitiateRequest>,
) -> Result<Json<ApiResponse<KhaltiInitiation>>, ServiceError> {
    let session = state.services.payments.khalti.initiate(&user, request).await?;
    Ok(Json(ApiResponse::with_message(
        session,
        "Payment initiated successfully",
    )))
}

/// Confirm a Khalti payment by `pidx`
#[utoipa::path(
    post,
    path = "/api/v1/payments/khalti/verify",
    request_body = KhaltiVerifyRequest,
    responses(
        (status = 200, description = "Payment verified", body = ApiResponse<KhaltiVerification>),
        (status = 400, description = "Payment not completed or amount mismatch", body = crate::errors::ErrorResponse),
        (status = 404, description = "No order for this pidx", body = crate::errors::ErrorResponse),
        (status = 504, description = "Khalti timed out", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn verify_khalti(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(request): ValidatedJson<KhaltiVerifyRequest>,
) -> Result<Json<ApiResponse<KhaltiVerification>>, ServiceError> {
    let verification = state.services.payments.khalti.verify(&user, request).await?;
    Ok(Json(ApiResponse::with_message(
        verification,
        "Payment verified successfully",
    )))
}

/// Build the signed eSewa payment form for an order
#[utoipa::path(
    post,
    path = "/api/v1/payments/esewa/initiate",
    request_body = EsewaInitiateRequest,
    responses(
        (status = 200, description = "eSewa payment initiated", body = ApiResponse<EsewaInitiation>),
        (status = 400, description = "Order not payable with eSewa", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the order's customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn initiate_esewa(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(request): ValidatedJson<EsewaInitiateRequest>,
) -> Result<Json<ApiResponse<EsewaInitiation>>, ServiceError> {
    let initiation = state.services.payments.esewa.initiate(&user, request).await?;
    Ok(Json(ApiResponse::with_message(
        initiation,
        "eSewa payment initiated successfully",
    )))
}

/// Payment state of an eSewa transaction
#[utoipa::path(
    get,
    path = "/api/v1/payments/esewa/verify/{transaction_id}",
    params(("transaction_id" = String, Path, description = "eSewa transaction id (pid)")),
    responses(
        (status = 200, description = "Payment status", body = ApiResponse<EsewaPaymentStatus>),
        (status = 403, description = "Not the order's customer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn esewa_payment_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(transaction_id): Path<String>,
) -> Result<Json<ApiResponse<EsewaPaymentStatus>>, ServiceError> {
    let status = state
        .services
        .payments
        .esewa
        .payment_status(&user, &transaction_id)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

/// Online-payment orders of the calling customer
#[utoipa::path(
    get,
    path = "/api/v1/payments/transactions",
    responses(
        (status = 200, description = "Transactions, newest first", body = ApiResponse<TransactionList>),
        (status = 403, description = "Customers only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<TransactionList>>, ServiceError> {
    let transactions = state.services.payments.transactions(&user).await?;
    Ok(Json(ApiResponse::success(transactions)))
}
