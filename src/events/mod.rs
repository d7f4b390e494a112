use crate::entities::order::{self, OrderStatus, PaymentMethod};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod outbox;

/// Stock level reached by a decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockAlertLevel {
    LowStock,
    OutOfStock,
}

/// Order parties attached to every order event so the sink can notify both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: Uuid,
    pub order_code: String,
    pub customer_id: Uuid,
    pub vendor_id: Uuid,
}

impl From<&order::Model> for OrderRef {
    fn from(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            order_code: order.order_code.clone(),
            customer_id: order.customer_id,
            vendor_id: order.vendor_id,
        }
    }
}

// Lifecycle events handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderPlaced {
        order: OrderRef,
        total: Decimal,
        payment_method: PaymentMethod,
    },
    OrderStatusChanged {
        order: OrderRef,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled {
        order: OrderRef,
        cancelled_by: Uuid,
        role: String,
        reason: Option<String>,
    },
    PaymentSucceeded {
        order: OrderRef,
        provider: PaymentMethod,
        amount: Decimal,
        reference: Option<String>,
    },
    PaymentFailed {
        order: OrderRef,
        provider: PaymentMethod,
        amount: Decimal,
        reason: String,
    },
    InventoryAlert {
        product_id: Uuid,
        vendor_id: Uuid,
        product_name: String,
        level: StockAlertLevel,
        stock: i32,
    },
    /// Hand-off to the external refund workflow.
    RefundRequested {
        order: OrderRef,
        provider: PaymentMethod,
        amount: Decimal,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::OrderPlaced { .. } => "order_placed",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::PaymentSucceeded { .. } => "payment_succeeded",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::InventoryAlert { .. } => "inventory_alert",
            Event::RefundRequested { .. } => "refund_requested",
        }
    }

    /// Aggregate the event belongs to, as `(type, id)`.
    pub fn aggregate(&self) -> (&'static str, Uuid) {
        match self {
            Event::InventoryAlert { product_id, .. } => ("product", *product_id),
            Event::OrderPlaced { order, .. }
            | Event::OrderStatusChanged { order, .. }
            | Event::OrderCancelled { order, .. }
            | Event::PaymentSucceeded { order, .. }
            | Event::PaymentFailed { order, .. }
            | Event::RefundRequested { order, .. } => ("order", order.order_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event channel closed")]
    ChannelClosed,
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Destination for lifecycle events. Injected into the outbox worker.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<(), EventError>;
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), EventError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| EventError::ChannelClosed)
    }
}

#[async_trait]
impl NotificationSink for EventSender {
    async fn deliver(&self, event: &Event) -> Result<(), EventError> {
        self.send(event.clone()).await
    }
}

/// Default in-process consumer: fans each event out to its recipients' logs.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPlaced { order, total, .. } => {
                info!(order_code = %order.order_code, customer = %order.customer_id, vendor = %order.vendor_id, %total, "notify: new order");
            }
            Event::OrderStatusChanged {
                order,
                old_status,
                new_status,
            } => {
                info!(order_code = %order.order_code, customer = %order.customer_id, %old_status, %new_status, "notify: order status changed");
            }
            Event::OrderCancelled { order, role, .. } => {
                info!(order_code = %order.order_code, customer = %order.customer_id, vendor = %order.vendor_id, by = %role, "notify: order cancelled");
            }
            Event::PaymentSucceeded {
                order,
                provider,
                amount,
                ..
            } => {
                info!(order_code = %order.order_code, customer = %order.customer_id, vendor = %order.vendor_id, %provider, %amount, "notify: payment received");
            }
            Event::PaymentFailed {
                order,
                provider,
                reason,
                ..
            } => {
                warn!(order_code = %order.order_code, customer = %order.customer_id, vendor = %order.vendor_id, %provider, %reason, "notify: payment failed");
            }
            Event::InventoryAlert {
                product_name,
                vendor_id,
                level,
                stock,
                ..
            } => {
                warn!(product = %product_name, vendor = %vendor_id, ?level, stock, "notify: inventory alert");
            }
            Event::RefundRequested {
                order,
                provider,
                amount,
            } => {
                info!(order_code = %order.order_code, %provider, %amount, "refund requested");
            }
        }
    }

    info!("Event channel closed; stopping event processing loop");
}
