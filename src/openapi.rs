use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers::{
    delivery_fee, orders, outbox_admin, payment_webhooks, payments, promotions,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "MomoSewa API",
        version = "1.0.0",
        description = r#"
# MomoSewa marketplace API

Order placement, order lifecycle, promo codes, delivery fees and Khalti/eSewa payment
reconciliation for a multi-vendor food-delivery marketplace.

## Authentication

Endpoints that act on behalf of a user require a bearer token issued by the identity service:

```
Authorization: Bearer <jwt>
```

The eSewa webhook and browser redirects are public; the webhook is trusted only through its
HMAC signature.

## Responses

Every JSON response uses the envelope `{success, message?, data?, details?}`. Request-shape
errors return 422 with `details: [{field, message}]`.
"#
    ),
    paths(
        crate::health_check,
        orders::create_order,
        orders::list_orders,
        orders::get_order,
        orders::track_order,
        orders::update_order_status,
        orders::cancel_order,
        payments::initiate_khalti,
        payments::verify_khalti,
        payments::initiate_esewa,
        payments::esewa_payment_status,
        payments::list_transactions,
        payment_webhooks::esewa_webhook,
        payment_webhooks::esewa_success,
        payment_webhooks::esewa_failure,
        promotions::validate_promo_code,
        promotions::list_promo_codes,
        promotions::create_promo_code,
        promotions::update_promo_code,
        promotions::delete_promo_code,
        delivery_fee::get_delivery_fee,
        delivery_fee::get_delivery_fee_settings,
        delivery_fee::update_delivery_fee_settings,
        outbox_admin::list_outbox,
        outbox_admin::retry_outbox,
    ),
    components(
        schemas(
            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentStatus,
            crate::entities::order::PaymentMethod,
            crate::entities::promo_code::DiscountType,
            crate::services::orders::CreateOrderRequest,
            crate::services::orders::OrderItemRequest,
            crate::services::orders::DeliveryAddress,
            crate::services::orders::OrderView,
            crate::services::orders::OrderItemView,
            crate::services::orders::OrderTracking,
            orders::UpdateStatusRequest,
            orders::CancelOrderRequest,
            crate::services::payments::khalti::KhaltiInitiateRequest,
            crate::services::payments::khalti::KhaltiInitiation,
            crate::services::payments::khalti::KhaltiVerifyRequest,
            crate::services::payments::khalti::KhaltiLookup,
            crate::services::payments::khalti::KhaltiVerification,
            crate::services::payments::esewa::EsewaInitiateRequest,
            crate::services::payments::esewa::EsewaFormData,
            crate::services::payments::esewa::EsewaInitiation,
            crate::services::payments::esewa::EsewaWebhookAck,
            crate::services::payments::esewa::EsewaPaymentStatus,
            crate::services::payments::TransactionSummary,
            crate::services::payments::TransactionList,
            crate::services::promotions::ValidatePromoRequest,
            crate::services::promotions::PromoValidation,
            crate::services::promotions::CreatePromoCodeRequest,
            crate::services::promotions::UpdatePromoCodeRequest,
            crate::services::promotions::PromoCodeView,
            crate::services::pricing::DeliveryFeeSchedule,
            delivery_fee::DeliveryFeeQuote,
            delivery_fee::UpdateDeliveryFeeRequest,
            outbox_admin::OutboxItem,
            crate::errors::ErrorResponse,
            crate::errors::FieldError,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "orders", description = "Order placement and lifecycle"),
        (name = "payments", description = "Khalti and eSewa payments"),
        (name = "promo-codes", description = "Promo code preview and administration"),
        (name = "delivery-fee", description = "Delivery fee quotes and settings"),
        (name = "admin", description = "Operational endpoints"),
        (name = "health", description = "Service health"),
    )
)]
pub struct ApiDocV1;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDocV1::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_order_and_payment_routes() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("MomoSewa API"));
        assert!(json.contains("/api/v1/orders/{id}/cancel"));
        assert!(json.contains("/api/v1/payments/esewa/webhook"));
        assert!(json.contains("\"Bearer\""));
    }
}
