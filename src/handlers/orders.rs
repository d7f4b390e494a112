use super::common::{json_rejection, parse_uuid, ValidatedJson};
use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::orders::{CreateOrderRequest, OrderListQuery, OrderTracking, OrderView};
use crate::{ApiResponse, AppState, PaginatedResponse};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(default)]
pub struct UpdateStatusRequest {
    /// One of `pending`, `preparing`, `on-the-way`, `delivered`, `cancelled`.
    #[validate(length(min = 1, message = "Status is required"))]
    #[schema(example = "preparing")]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/track", get(track_order))
        .route("/:id/status", put(update_order_status))
        .route("/:id/cancel", put(cancel_order))
}

/// Place an order
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<OrderView>),
        (status = 400, description = "Domain rule violated", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Only customers may order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product or vendor not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Malformed request", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<OrderView>>), ServiceError> {
    let Json(request) = payload.map_err(json_rejection)?;
    let order = state.services.orders.create_order(&user, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(order, "Order placed successfully")),
    ))
}

/// List orders visible to the caller
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(
        ("status" = Option<String>, Query, description = "Filter by order status"),
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("limit" = Option<u64>, Query, description = "Items per page (default: 20, max: 100)"),
    ),
    responses(
        (status = 200, description = "Orders", body = ApiResponse<PaginatedResponse<OrderView>>),
        (status = 400, description = "Unknown status filter", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderView>>>, ServiceError> {
    let page = state.services.orders.list_orders(&user, query).await?;
    Ok(Json(ApiResponse::success(page)))
}

/// Get one order with its items
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order", body = ApiResponse<OrderView>),
        (status = 403, description = "Not a party to this order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order_id = parse_uuid(&id, "Order")?;
    let order = state.services.orders.get_order(&user, order_id).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Fulfillment progress of an order
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/track",
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Tracking snapshot", body = ApiResponse<OrderTracking>),
        (status = 403, description = "Not a party to this order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn track_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<OrderTracking>>, ServiceError> {
    let order_id = parse_uuid(&id, "Order")?;
    let tracking = state.services.orders.track_order(&user, order_id).await?;
    Ok(Json(ApiResponse::success(tracking)))
}

/// Move an order to its next fulfillment status
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    params(("id" = String, Path, description = "Order ID")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderView>),
        (status = 400, description = "Unknown status or illegal transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the order's vendor", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Concurrent modification", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ValidatedJson(request): ValidatedJson<UpdateStatusRequest>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order_id = parse_uuid(&id, "Order")?;
    let order = state
        .services
        .orders
        .update_status(&user, order_id, &request.status)
        .await?;
    Ok(Json(ApiResponse::with_message(order, "Order status updated")))
}

/// Cancel an order
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = String, Path, description = "Order ID")),
    request_body(content = CancelOrderRequest, description = "Optional cancellation reason"),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderView>),
        (status = 400, description = "Order cannot be cancelled at this stage", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not allowed to cancel", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Option<Json<CancelOrderRequest>>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order_id = parse_uuid(&id, "Order")?;
    let reason = body.and_then(|Json(b)| b.reason);
    let order = state
        .services
        .orders
        .cancel_order(&user, order_id, reason)
        .await?;
    Ok(Json(ApiResponse::with_message(order, "Order cancelled")))
}
