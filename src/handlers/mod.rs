pub mod common;
pub mod delivery_fee;
pub mod orders;
pub mod outbox_admin;
pub mod payment_webhooks;
pub mod payments;
pub mod promotions;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::services::{
    orders::OrderService,
    payments::{build_http_client, EsewaGateway, KhaltiGateway, PaymentService},
    promotions::PromoCodeService,
    settings::SettingsService,
};
use std::sync::Arc;

pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub promotions: Arc<PromoCodeService>,
    pub settings: Arc<SettingsService>,
}

impl AppServices {
    /// Wires every service over one pool. Provider calls share a client bounded by
    /// `payment_timeout_ms`.
    pub fn new(db_pool: Arc<DbPool>, config: &AppConfig) -> Result<Self, ServiceError> {
        let settings = SettingsService::new(db_pool.clone(), &config.delivery);
        let promotions = PromoCodeService::new(db_pool.clone());
        let orders = OrderService::new(db_pool.clone(), settings.clone(), promotions.clone());

        let http = build_http_client(config.payment_timeout())?;
        let khalti = KhaltiGateway::new(db_pool.clone(), http.clone(), config.khalti.clone());
        let esewa = EsewaGateway::new(
            db_pool.clone(),
            http,
            config.esewa.clone(),
            config.frontend_url.clone(),
        );
        let payments = PaymentService::new(db_pool, khalti, esewa);

        Ok(Self {
            orders: Arc::new(orders),
            payments: Arc::new(payments),
            promotions: Arc::new(promotions),
            settings: Arc::new(settings),
        })
    }
}
