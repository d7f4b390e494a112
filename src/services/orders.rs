use crate::auth::{AuthUser, Role};
use crate::entities::{
    order::{self, OrderStatus, PaymentMethod, PaymentStatus},
    order_item, product, product_variant, vendor,
};
use crate::errors::{FieldError, ServiceError};
use crate::events::{outbox, Event, OrderRef};
use crate::services::inventory::{self, StockChange};
use crate::services::order_status::{can_cancel, is_valid_transition};
use crate::services::pricing::{self, PricedLine};
use crate::services::promotions::{self, PromoCodeService, PromoValidation};
use crate::services::settings::SettingsService;
use crate::PaginatedResponse;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    ModelTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

const MAX_ITEM_QUANTITY: i32 = 100;
const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 \-]{6,18}$").expect("phone pattern compiles"));

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryAddress {
    #[validate(length(min = 1, message = "Full name is required"))]
    pub full_name: String,
    #[validate(regex(path = "PHONE_RE", message = "A valid phone number is required"))]
    pub phone: String,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, message = "Area is required"))]
    pub area: String,
    #[validate(length(min = 1, message = "Nearest landmark is required"))]
    pub nearest_landmark: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    #[serde(default)]
    pub variant: Option<String>,
    pub quantity: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
    pub delivery_address: DeliveryAddress,
    /// `cash-on-delivery`, `khalti` or `esewa`
    #[schema(example = "esewa")]
    pub payment_method: String,
    pub promo_code: Option<String>,
    pub notes: Option<String>,
}

impl CreateOrderRequest {
    /// Request-shape problems, reported as a field list before any lookup happens.
    pub fn shape_errors(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if self.items.is_empty() {
            errors.push(FieldError::new("items", "Order must have at least one item"));
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.quantity < 1 || item.quantity > MAX_ITEM_QUANTITY {
                errors.push(FieldError::new(
                    format!("items[{idx}].quantity"),
                    format!("Quantity must be between 1 and {MAX_ITEM_QUANTITY}"),
                ));
            }
        }

        let address = DeliveryAddress {
            full_name: self.delivery_address.full_name.trim().to_string(),
            city: self.delivery_address.city.trim().to_string(),
            area: self.delivery_address.area.trim().to_string(),
            nearest_landmark: self.delivery_address.nearest_landmark.trim().to_string(),
            ..self.delivery_address.clone()
        };
        if let Err(ServiceError::StructuralInvalid(fields)) =
            address.validate().map_err(ServiceError::from)
        {
            errors.extend(fields.into_iter().map(|f| {
                FieldError::new(format!("deliveryAddress.{}", f.field), f.message)
            }));
        }

        if PaymentMethod::parse(&self.payment_method).is_none() {
            errors.push(FieldError::new(
                "paymentMethod",
                "Valid payment method is required",
            ));
        }

        errors
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub name: String,
    pub variant: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub unit_price: Decimal,
    pub quantity: i32,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemView {
    fn from(item: order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            name: item.name,
            variant: item.variant,
            unit_price: item.unit_price,
            quantity: item.quantity,
            line_total: item.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub order_code: String,
    pub customer_id: Uuid,
    pub vendor_id: Uuid,
    pub items: Vec<OrderItemView>,
    #[schema(value_type = Object)]
    pub delivery_address: serde_json::Value,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub subtotal: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub discount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub delivery_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub total: Decimal,
    pub promo_code: Option<String>,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub khalti_transaction_id: Option<String>,
    pub esewa_transaction_id: Option<String>,
    pub esewa_ref_id: Option<String>,
    pub notes: Option<String>,
    pub cancel_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub delivered_date: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderView {
    pub fn from_parts(order: order::Model, items: Vec<order_item::Model>) -> Self {
        let mut items = items;
        items.sort_by_key(|i| i.position);
        Self {
            id: order.id,
            order_code: order.order_code,
            customer_id: order.customer_id,
            vendor_id: order.vendor_id,
            items: items.into_iter().map(OrderItemView::from).collect(),
            delivery_address: order.delivery_address,
            subtotal: order.subtotal,
            discount: order.discount,
            delivery_fee: order.delivery_fee,
            total: order.total,
            promo_code: order.promo_code,
            status: order.status,
            payment_method: order.payment_method,
            payment_status: order.payment_status,
            khalti_transaction_id: order.khalti_transaction_id,
            esewa_transaction_id: order.esewa_transaction_id,
            esewa_ref_id: order.esewa_ref_id,
            notes: order.notes,
            cancel_reason: order.cancel_reason,
            paid_at: order.paid_at,
            delivered_date: order.delivered_at,
            cancelled_at: order.cancelled_at,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderTracking {
    pub order_code: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_date: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(default)]
pub struct OrderListQuery {
    pub status: Option<String>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

struct ValidatedLine {
    product: product::Model,
    variant: Option<String>,
    unit_price: Decimal,
    quantity: i32,
}

/// `ORD-{base36 millis}-{5 random}`, upper-case.
pub fn generate_order_code() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    format!("ORD-{}-{}", to_base36(millis), suffix).to_uppercase()
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Vendor profile owned by `user_id`, if any.
pub async fn vendor_for_user<C: ConnectionTrait>(
    db: &C,
    user_id: Uuid,
) -> Result<Option<vendor::Model>, ServiceError> {
    Ok(vendor::Entity::find()
        .filter(vendor::Column::UserId.eq(user_id))
        .one(db)
        .await?)
}

/// Read access: the order's customer, its vendor, or an admin.
pub async fn ensure_can_view<C: ConnectionTrait>(
    db: &C,
    actor: &AuthUser,
    order: &order::Model,
) -> Result<(), ServiceError> {
    let allowed = match actor.role {
        Role::Admin => true,
        Role::Customer => order.customer_id == actor.user_id,
        Role::Vendor => vendor_for_user(db, actor.user_id)
            .await?
            .is_some_and(|v| v.id == order.vendor_id),
    };
    if allowed {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Access denied".to_string()))
    }
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    settings: SettingsService,
    promotions: PromoCodeService,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        settings: SettingsService,
        promotions: PromoCodeService,
    ) -> Self {
        Self {
            db,
            settings,
            promotions,
        }
    }

    /// Validates the cart, prices it and persists the order, its stock decrements,
    /// promo usage and outbox events in one transaction.
    #[instrument(skip(self, request), fields(customer_id = %actor.user_id))]
    pub async fn create_order(
        &self,
        actor: &AuthUser,
        request: CreateOrderRequest,
    ) -> Result<OrderView, ServiceError> {
        if !actor.is_customer() {
            return Err(ServiceError::Forbidden(
                "Only customers can place orders".to_string(),
            ));
        }
        let shape = request.shape_errors();
        if !shape.is_empty() {
            return Err(ServiceError::StructuralInvalid(shape));
        }
        let payment_method = PaymentMethod::parse(&request.payment_method).ok_or_else(|| {
            ServiceError::ValidationError("Valid payment method is required".to_string())
        })?;

        let db = &*self.db;
        let mut validated = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = product::Entity::find_by_id(item.product_id)
                .one(db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", item.product_id))
                })?;
            if !product.is_available {
                return Err(ServiceError::ValidationError(format!(
                    "Product {} is not available",
                    product.name
                )));
            }
            if !product.has_stock_for(item.quantity) {
                return Err(ServiceError::InsufficientStock(format!(
                    "Insufficient stock for {}",
                    product.name
                )));
            }

            let variants = if item.variant.is_some() {
                product.find_related(product_variant::Entity).all(db).await?
            } else {
                Vec::new()
            };
            let (unit_price, variant) =
                pricing::resolve_unit_price(product.price, &variants, item.variant.as_deref());

            validated.push(ValidatedLine {
                product,
                variant,
                unit_price: unit_price.round_dp(2),
                quantity: item.quantity,
            });
        }

        let vendor_id = validated[0].product.vendor_id;
        if validated.iter().any(|l| l.product.vendor_id != vendor_id) {
            return Err(ServiceError::ValidationError(
                "All items in an order must come from the same vendor".to_string(),
            ));
        }

        let lines: Vec<PricedLine> = validated
            .iter()
            .map(|l| PricedLine {
                unit_price: l.unit_price,
                quantity: l.quantity,
            })
            .collect();
        let subtotal = pricing::subtotal(&lines);

        let promo: Option<PromoValidation> = match request
            .promo_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            Some(code) => {
                let result = self.promotions.validate(code, subtotal).await?;
                if !result.valid {
                    return Err(ServiceError::ValidationError(result.message));
                }
                Some(result)
            }
            None => None,
        };

        let schedule = self.settings.delivery_fee_schedule().await?;
        let totals =
            pricing::compute_totals(&lines, promo.as_ref().map(|p| p.discount), &schedule);
        if totals.total.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "Order total cannot be negative".to_string(),
            ));
        }

        let vendor = vendor::Entity::find_by_id(vendor_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Vendor not found".to_string()))?;
        if !vendor.accepts_orders() {
            return Err(ServiceError::ValidationError(
                "Vendor is not available".to_string(),
            ));
        }

        let delivery_address = serde_json::to_value(&request.delivery_address)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let promo_model = promo.as_ref().and_then(|p| p.promo.clone());

        let txn = db.begin().await.map_err(|e| {
            error!("Failed to begin order transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_code: Set(generate_order_code()),
            customer_id: Set(actor.user_id),
            vendor_id: Set(vendor.id),
            delivery_address: Set(delivery_address),
            subtotal: Set(totals.subtotal),
            discount: Set(totals.discount),
            delivery_fee: Set(totals.delivery_fee),
            total: Set(totals.total),
            promo_code: Set(promo_model.as_ref().map(|p| p.code.clone())),
            promo_code_id: Set(promo_model.as_ref().map(|p| p.id)),
            status: Set(OrderStatus::Pending),
            payment_method: Set(payment_method),
            payment_status: Set(PaymentStatus::Pending),
            khalti_transaction_id: Set(None),
            esewa_transaction_id: Set(None),
            esewa_ref_id: Set(None),
            payment_details: Set(None),
            notes: Set(request
                .notes
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)),
            cancel_reason: Set(None),
            cancelled_by: Set(None),
            cancelled_by_role: Set(None),
            paid_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!("Failed to insert order: {}", e);
            ServiceError::from_write(e, "Order code collision, please retry")
        })?;

        let mut items = Vec::with_capacity(validated.len());
        let mut stock_changes: Vec<(StockChange, &product::Model)> = Vec::new();
        for (position, line) in validated.iter().enumerate() {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(line.product.id),
                position: Set(position as i32),
                name: Set(line.product.name.clone()),
                variant: Set(line.variant.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                line_total: Set(line.unit_price * Decimal::from(line.quantity)),
            }
            .insert(&txn)
            .await?;
            items.push(item);

            if let Some(change) = inventory::decrement_stock(&txn, &line.product, line.quantity).await? {
                stock_changes.push((change, &line.product));
            }
        }

        if let Some(promo) = &promo_model {
            promotions::consume_usage(&txn, promo.id).await?;
        }

        outbox::enqueue(
            &txn,
            &Event::OrderPlaced {
                order: OrderRef::from(&order),
                total: order.total,
                payment_method: order.payment_method,
            },
        )
        .await?;
        for (change, product) in &stock_changes {
            if let Some(level) = change.alert() {
                outbox::enqueue(
                    &txn,
                    &Event::InventoryAlert {
                        product_id: product.id,
                        vendor_id: product.vendor_id,
                        product_name: product.name.clone(),
                        level,
                        stock: change.new_stock,
                    },
                )
                .await?;
            }
        }

        txn.commit().await.map_err(|e| {
            error!("Failed to commit order {}: {}", order.order_code, e);
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_code = %order.order_code,
            total = %order.total,
            items = items.len(),
            "order created"
        );
        Ok(OrderView::from_parts(order, items))
    }

    /// Moves an order forward. Customers may not call this; vendors only for their own orders.
    #[instrument(skip(self), fields(user_id = %actor.user_id))]
    pub async fn update_status(
        &self,
        actor: &AuthUser,
        order_id: Uuid,
        raw_status: &str,
    ) -> Result<OrderView, ServiceError> {
        if actor.is_customer() {
            return Err(ServiceError::Forbidden(
                "Only vendors or admins can update order status".to_string(),
            ));
        }
        let target = OrderStatus::parse(raw_status)
            .ok_or_else(|| ServiceError::InvalidStatus(format!("Invalid status: {raw_status}")))?;

        let order = self.find_order(order_id).await?;
        self.ensure_vendor_owns(actor, &order).await?;

        if target == OrderStatus::Cancelled {
            return self.cancel_order(actor, order_id, None).await;
        }
        if order.status == target {
            return self.view(order).await;
        }
        if !is_valid_transition(order.status, target) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot change order status from {} to {}",
                order.status, target
            )));
        }

        let now = Utc::now();
        let mut changes = order::ActiveModel {
            status: Set(target),
            updated_at: Set(now),
            ..Default::default()
        };
        if target == OrderStatus::Delivered {
            // Delivery settles cash-on-delivery; a no-op for orders already paid online.
            changes.delivered_at = Set(Some(now));
            changes.payment_status = Set(PaymentStatus::Paid);
            if order.paid_at.is_none() {
                changes.paid_at = Set(Some(now));
            }
        }

        let txn = self.db.begin().await?;
        let result = order::Entity::update_many()
            .set(changes)
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(order.status))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "Order was modified concurrently; reload and retry".to_string(),
            ));
        }
        outbox::enqueue(
            &txn,
            &Event::OrderStatusChanged {
                order: OrderRef::from(&order),
                old_status: order.status,
                new_status: target,
            },
        )
        .await?;
        txn.commit().await?;

        info!(order_code = %order.order_code, from = %order.status, to = %target, "order status updated");
        let updated = self.find_order(order_id).await?;
        self.view(updated).await
    }

    /// Cancels an order. Customers only while pending/preparing; a paid order becomes
    /// refunded and a refund request is queued.
    #[instrument(skip(self, reason), fields(user_id = %actor.user_id))]
    pub async fn cancel_order(
        &self,
        actor: &AuthUser,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<OrderView, ServiceError> {
        let order = self.find_order(order_id).await?;
        match actor.role {
            Role::Customer if order.customer_id != actor.user_id => {
                return Err(ServiceError::Forbidden(
                    "Not authorized to cancel this order".to_string(),
                ));
            }
            Role::Vendor => self.ensure_vendor_owns(actor, &order).await?,
            _ => {}
        }
        if !can_cancel(actor.role, order.status) {
            return Err(ServiceError::ValidationError(
                "Order cannot be cancelled at this stage".to_string(),
            ));
        }

        let now = Utc::now();
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let refund = order.payment_status == PaymentStatus::Paid;
        let mut changes = order::ActiveModel {
            status: Set(OrderStatus::Cancelled),
            cancelled_at: Set(Some(now)),
            cancelled_by: Set(Some(actor.user_id)),
            cancelled_by_role: Set(Some(actor.role.to_string())),
            cancel_reason: Set(reason.clone()),
            updated_at: Set(now),
            ..Default::default()
        };
        if refund {
            changes.payment_status = Set(PaymentStatus::Refunded);
        }

        let txn = self.db.begin().await?;
        let result = order::Entity::update_many()
            .set(changes)
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(order.status))
            .filter(order::Column::PaymentStatus.eq(order.payment_status))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "Order was modified concurrently; reload and retry".to_string(),
            ));
        }

        let order_ref = OrderRef::from(&order);
        outbox::enqueue(
            &txn,
            &Event::OrderCancelled {
                order: order_ref.clone(),
                cancelled_by: actor.user_id,
                role: actor.role.to_string(),
                reason,
            },
        )
        .await?;
        if refund {
            outbox::enqueue(
                &txn,
                &Event::RefundRequested {
                    order: order_ref,
                    provider: order.payment_method,
                    amount: order.total,
                },
            )
            .await?;
        }
        txn.commit().await?;

        if refund {
            warn!(order_code = %order.order_code, "paid order cancelled; refund requested");
        }
        info!(order_code = %order.order_code, by = %actor.role, "order cancelled");
        let updated = self.find_order(order_id).await?;
        self.view(updated).await
    }

    /// Role-scoped listing, newest first.
    #[instrument(skip(self, query), fields(user_id = %actor.user_id))]
    pub async fn list_orders(
        &self,
        actor: &AuthUser,
        query: OrderListQuery,
    ) -> Result<PaginatedResponse<OrderView>, ServiceError> {
        let db = &*self.db;
        let mut condition = Condition::all();
        match actor.role {
            Role::Customer => {
                condition = condition.add(order::Column::CustomerId.eq(actor.user_id));
            }
            Role::Vendor => {
                let vendor = vendor_for_user(db, actor.user_id).await?.ok_or_else(|| {
                    ServiceError::Forbidden("Vendor profile not found".to_string())
                })?;
                condition = condition.add(order::Column::VendorId.eq(vendor.id));
            }
            Role::Admin => {}
        }
        if let Some(raw) = query.status.as_deref().filter(|s| !s.is_empty()) {
            let status = OrderStatus::parse(raw)
                .ok_or_else(|| ServiceError::InvalidStatus(format!("Invalid status: {raw}")))?;
            condition = condition.add(order::Column::Status.eq(status));
        }

        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let page = query.page.unwrap_or(1).max(1);

        let paginator = order::Entity::find()
            .filter(condition)
            .order_by_desc(order::Column::CreatedAt)
            .paginate(db, limit);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
        if !ids.is_empty() {
            for item in order_item::Entity::find()
                .filter(order_item::Column::OrderId.is_in(ids))
                .all(db)
                .await?
            {
                items_by_order.entry(item.order_id).or_default().push(item);
            }
        }

        let items = orders
            .into_iter()
            .map(|o| {
                let items = items_by_order.remove(&o.id).unwrap_or_default();
                OrderView::from_parts(o, items)
            })
            .collect();

        Ok(PaginatedResponse {
            items,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        })
    }

    pub async fn get_order(
        &self,
        actor: &AuthUser,
        order_id: Uuid,
    ) -> Result<OrderView, ServiceError> {
        let order = self.find_order(order_id).await?;
        ensure_can_view(&*self.db, actor, &order).await?;
        self.view(order).await
    }

    pub async fn track_order(
        &self,
        actor: &AuthUser,
        order_id: Uuid,
    ) -> Result<OrderTracking, ServiceError> {
        let order = self.find_order(order_id).await?;
        ensure_can_view(&*self.db, actor, &order).await?;
        Ok(OrderTracking {
            order_code: order.order_code,
            status: order.status,
            payment_status: order.payment_status,
            created_at: order.created_at,
            delivered_date: order.delivered_at,
            cancelled_at: order.cancelled_at,
        })
    }

    async fn find_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))
    }

    async fn view(&self, order: order::Model) -> Result<OrderView, ServiceError> {
        let items = order.find_related(order_item::Entity).all(&*self.db).await?;
        Ok(OrderView::from_parts(order, items))
    }

    /// Vendors may only touch orders placed with their own profile. Other roles pass.
    async fn ensure_vendor_owns(
        &self,
        actor: &AuthUser,
        order: &order::Model,
    ) -> Result<(), ServiceError> {
        if !actor.is_vendor() {
            return Ok(());
        }
        match vendor_for_user(&*self.db, actor.user_id).await? {
            Some(v) if v.id == order.vendor_id => Ok(()),
            _ => Err(ServiceError::Forbidden(
                "Not authorized to update this order".to_string(),
            )),
        }
    }
}
