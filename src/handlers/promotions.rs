use super::common::{parse_uuid, ValidatedJson};
use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::promotions::{
    CreatePromoCodeRequest, PromoCodeView, PromoValidation, UpdatePromoCodeRequest,
    ValidatePromoRequest,
};
use crate::{ApiResponse, AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};

pub fn promo_code_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_promo_codes).post(create_promo_code))
        .route("/validate", post(validate_promo_code))
        .route("/:id", put(update_promo_code).delete(delete_promo_code))
}

/// Preview a promo code against an order amount
///
/// Never consumes a use of the code.
#[utoipa::path(
    post,
    path = "/api/v1/promo-codes/validate",
    request_body = ValidatePromoRequest,
    responses(
        (status = 200, description = "Evaluation result; `valid` may be false", body = ApiResponse<PromoValidation>),
        (status = 422, description = "Missing code or order total", body = crate::errors::ErrorResponse),
    ),
    tag = "promo-codes"
)]
pub async fn validate_promo_code(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ValidatePromoRequest>,
) -> Result<Json<ApiResponse<PromoValidation>>, ServiceError> {
    let result = state
        .services
        .promotions
        .validate(&request.code, request.order_total.unwrap_or_default())
        .await?;
    Ok(Json(ApiResponse::success(result)))
}

/// Currently redeemable promo codes
#[utoipa::path(
    get,
    path = "/api/v1/promo-codes",
    responses((status = 200, description = "Active promo codes", body = ApiResponse<Vec<PromoCodeView>>)),
    tag = "promo-codes"
)]
pub async fn list_promo_codes(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<PromoCodeView>>>, ServiceError> {
    let codes = state.services.promotions.list_active().await?;
    Ok(Json(ApiResponse::success(codes)))
}

/// Create a promo code (admin)
#[utoipa::path(
    post,
    path = "/api/v1/promo-codes",
    request_body = CreatePromoCodeRequest,
    responses(
        (status = 201, description = "Promo code created", body = ApiResponse<PromoCodeView>),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
        (status = 409, description = "Code already exists", body = crate::errors::ErrorResponse),
        (status = 422, description = "Invalid fields", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "promo-codes"
)]
pub async fn create_promo_code(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(request): ValidatedJson<CreatePromoCodeRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PromoCodeView>>), ServiceError> {
    let promo = state.services.promotions.create(&user, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(promo, "Promo code created successfully")),
    ))
}

/// Update a promo code (admin)
#[utoipa::path(
    put,
    path = "/api/v1/promo-codes/{id}",
    params(("id" = String, Path, description = "Promo code ID")),
    request_body = UpdatePromoCodeRequest,
    responses(
        (status = 200, description = "Promo code updated", body = ApiResponse<PromoCodeView>),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
        (status = 404, description = "Promo code not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "promo-codes"
)]
pub async fn update_promo_code(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ValidatedJson(request): ValidatedJson<UpdatePromoCodeRequest>,
) -> Result<Json<ApiResponse<PromoCodeView>>, ServiceError> {
    let id = parse_uuid(&id, "Promo code")?;
    let promo = state.services.promotions.update(&user, id, request).await?;
    Ok(Json(ApiResponse::with_message(
        promo,
        "Promo code updated successfully",
    )))
}

/// Delete a promo code (admin)
#[utoipa::path(
    delete,
    path = "/api/v1/promo-codes/{id}",
    params(("id" = String, Path, description = "Promo code ID")),
    responses(
        (status = 200, description = "Promo code deleted"),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
        (status = 404, description = "Promo code not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "promo-codes"
)]
pub async fn delete_promo_code(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, ServiceError> {
    let id = parse_uuid(&id, "Promo code")?;
    state.services.promotions.delete(&user, id).await?;
    Ok(Json(ApiResponse::message("Promo code deleted successfully")))
}
