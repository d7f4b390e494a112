pub mod admin_setting;
pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod product;
pub mod product_variant;
pub mod promo_code;
pub mod vendor;
