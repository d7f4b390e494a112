use super::common::ValidatedJson;
use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::pricing::DeliveryFeeSchedule;
use crate::{ApiResponse, AppState};
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryFeeQuery {
    /// Goods amount after discount.
    pub order_total: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFeeQuote {
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub order_total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub delivery_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub free_delivery_threshold: Decimal,
    pub is_free_delivery: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateDeliveryFeeRequest {
    #[schema(value_type = Option<f64>)]
    pub free_delivery_threshold: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub delivery_fee: Option<Decimal>,
}

pub fn delivery_fee_routes() -> Router<AppState> {
    Router::new().route("/", get(get_delivery_fee))
}

pub fn admin_delivery_fee_routes() -> Router<AppState> {
    Router::new().route(
        "/",
        get(get_delivery_fee_settings).put(update_delivery_fee_settings),
    )
}

fn parse_order_total(raw: Option<&str>) -> Result<Decimal, ServiceError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::ValidationError("Order total is required".to_string()))?;
    match Decimal::from_str(raw) {
        Ok(total) if !total.is_sign_negative() => Ok(total),
        _ => Err(ServiceError::ValidationError(
            "Invalid order total".to_string(),
        )),
    }
}

/// Delivery fee for an order amount
#[utoipa::path(
    get,
    path = "/api/v1/delivery-fee",
    params(DeliveryFeeQuery),
    responses(
        (status = 200, description = "Fee quote", body = ApiResponse<DeliveryFeeQuote>),
        (status = 400, description = "Missing or invalid order total", body = crate::errors::ErrorResponse),
    ),
    tag = "delivery-fee"
)]
pub async fn get_delivery_fee(
    State(state): State<AppState>,
    Query(query): Query<DeliveryFeeQuery>,
) -> Result<Json<ApiResponse<DeliveryFeeQuote>>, ServiceError> {
    let order_total = parse_order_total(query.order_total.as_deref())?;
    let schedule = state.services.settings.delivery_fee_schedule().await?;
    let delivery_fee = schedule.fee_for(order_total);
    Ok(Json(ApiResponse::with_message(
        DeliveryFeeQuote {
            order_total,
            delivery_fee,
            free_delivery_threshold: schedule.free_threshold,
            is_free_delivery: delivery_fee.is_zero(),
        },
        "Delivery fee calculated successfully",
    )))
}

/// Current delivery fee settings (admin)
#[utoipa::path(
    get,
    path = "/api/v1/admin/delivery-fee",
    responses(
        (status = 200, description = "Current schedule", body = ApiResponse<DeliveryFeeSchedule>),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "delivery-fee"
)]
pub async fn get_delivery_fee_settings(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<DeliveryFeeSchedule>>, ServiceError> {
    if !user.is_admin() {
        return Err(ServiceError::Forbidden("Admin access required".to_string()));
    }
    let schedule = state.services.settings.delivery_fee_schedule().await?;
    Ok(Json(ApiResponse::success(schedule)))
}

/// Change the delivery fee settings (admin)
#[utoipa::path(
    put,
    path = "/api/v1/admin/delivery-fee",
    request_body = UpdateDeliveryFeeRequest,
    responses(
        (status = 200, description = "Updated schedule", body = ApiResponse<DeliveryFeeSchedule>),
        (status = 400, description = "Negative values", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "delivery-fee"
)]
pub async fn update_delivery_fee_settings(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(request): ValidatedJson<UpdateDeliveryFeeRequest>,
) -> Result<Json<ApiResponse<DeliveryFeeSchedule>>, ServiceError> {
    if !user.is_admin() {
        return Err(ServiceError::Forbidden("Admin access required".to_string()));
    }
    let schedule = state
        .services
        .settings
        .update_delivery_fee_schedule(request.free_delivery_threshold, request.delivery_fee)
        .await?;
    Ok(Json(ApiResponse::with_message(
        schedule,
        "Delivery fee settings updated successfully",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, "Order total is required")]
    #[case(Some(""), "Order total is required")]
    #[case(Some("abc"), "Invalid order total")]
    #[case(Some("-5"), "Invalid order total")]
    fn rejects_bad_totals(#[case] raw: Option<&str>, #[case] message: &str) {
        match parse_order_total(raw) {
            Err(ServiceError::ValidationError(m)) => assert_eq!(m, message),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn accepts_decimal_totals() {
        assert_eq!(parse_order_total(Some(" 420.50 ")).unwrap(), Decimal::new(42050, 2));
    }
}
