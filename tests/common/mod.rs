#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use momosewa_api::{
    auth::Claims,
    build_router,
    config::AppConfig,
    db,
    entities::{order, product, product_variant, promo_code, vendor},
    events::{outbox, Event, EventError, NotificationSink},
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

pub const JWT_SECRET: &str = "integration_test_secret_that_is_over_32_chars";
pub const ESEWA_SECRET: &str = "8gBm/:&EnhH.1/q";
pub const ESEWA_MERCHANT: &str = "EPAYTEST";
pub const FRONTEND_URL: &str = "http://frontend.test";

/// Collects every event the outbox dispatches.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, event: &Event) -> Result<(), EventError> {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .push(event.clone());
        Ok(())
    }
}

pub struct Customer {
    pub id: Uuid,
    pub token: String,
}

pub struct SeededVendor {
    pub vendor: vendor::Model,
    pub owner_token: String,
}

/// Application over a throwaway SQLite file, with both payment providers pointed at one
/// wiremock server.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub providers: MockServer,
    sink: Arc<RecordingSink>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("momosewa_test.db");
        let providers = MockServer::start().await;

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 4;
        cfg.db_min_connections = 1;
        cfg.frontend_url = FRONTEND_URL.to_string();
        cfg.payment_timeout_ms = 300;
        cfg.khalti.base_url = providers.uri();
        cfg.khalti.secret_key = "test-khalti-key".to_string();
        cfg.esewa.api_url = providers.uri();
        cfg.esewa.merchant_id = ESEWA_MERCHANT.to_string();
        cfg.esewa.secret_key = ESEWA_SECRET.to_string();
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let state = AppState::new(Arc::new(pool), cfg).expect("build app state");
        state
            .services
            .settings
            .init_delivery_fee_settings()
            .await
            .expect("seed delivery settings");

        Self {
            router: build_router(state.clone()),
            state,
            providers,
            sink: Arc::new(RecordingSink::default()),
            _dir: dir,
        }
    }

    pub fn token(user_id: Uuid, role: &str) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: (now + Duration::hours(1)).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode token")
    }

    pub fn customer() -> Customer {
        let id = Uuid::new_v4();
        Customer {
            id,
            token: Self::token(id, "customer"),
        }
    }

    pub fn admin_token() -> String {
        Self::token(Uuid::new_v4(), "admin")
    }

    /// Sends a request and returns the status with the JSON body (`Null` when empty).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {tok}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request");
        Self::into_parts(response).await
    }

    pub async fn post_form(&self, uri: &str, form: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .expect("build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");
        Self::into_parts(response).await
    }

    /// Follows nothing; returns the status and `Location` header.
    pub async fn redirect(&self, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (response.status(), location)
    }

    async fn into_parts(response: axum::response::Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Dispatches due outbox rows to the recording sink and returns everything recorded so far.
    pub async fn drain_events(&self) -> Vec<Event> {
        outbox::drain_once(&self.state.db, self.sink.as_ref(), &self.state.config.outbox)
            .await
            .expect("drain outbox");
        self.sink.events.lock().expect("sink lock poisoned").clone()
    }

    pub async fn seed_vendor(&self, name: &str) -> SeededVendor {
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let vendor = vendor::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(owner),
            business_name: Set(name.to_string()),
            status: Set(vendor::VendorStatus::Active),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed vendor");
        SeededVendor {
            vendor,
            owner_token: Self::token(owner, "vendor"),
        }
    }

    pub async fn seed_product(
        &self,
        vendor_id: Uuid,
        name: &str,
        price: Decimal,
        stock: i32,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            vendor_id: Set(vendor_id),
            name: Set(name.to_string()),
            price: Set(price),
            is_available: Set(true),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn set_product_available(&self, id: Uuid, is_available: bool) {
        product::ActiveModel {
            id: Set(id),
            is_available: Set(is_available),
            ..Default::default()
        }
        .update(&*self.state.db)
        .await
        .expect("update product availability");
    }

    pub async fn set_vendor_state(&self, id: Uuid, status: vendor::VendorStatus, is_active: bool) {
        vendor::ActiveModel {
            id: Set(id),
            status: Set(status),
            is_active: Set(is_active),
            ..Default::default()
        }
        .update(&*self.state.db)
        .await
        .expect("update vendor state");
    }

    pub async fn seed_variant(
        &self,
        product_id: Uuid,
        name: &str,
        price: Decimal,
    ) -> product_variant::Model {
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            name: Set(name.to_string()),
            price: Set(price),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed variant")
    }

    pub async fn seed_promo(
        &self,
        code: &str,
        discount_type: promo_code::DiscountType,
        value: Decimal,
        min_order_amount: Decimal,
        max_discount: Option<Decimal>,
        usage_limit: i32,
    ) -> promo_code::Model {
        let now = Utc::now();
        promo_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            description: Set(None),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            min_order_amount: Set(min_order_amount),
            max_discount: Set(max_discount),
            usage_limit: Set(usage_limit),
            used_count: Set(0),
            valid_from: Set(now - Duration::days(1)),
            valid_until: Set(now + Duration::days(30)),
            is_active: Set(true),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed promo code")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn promo(&self, id: Uuid) -> promo_code::Model {
        promo_code::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load promo")
            .expect("promo exists")
    }

    pub async fn order(&self, id: &str) -> order::Model {
        let id = Uuid::parse_str(id).expect("order id");
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    /// Places a single-line order and returns the created order JSON.
    pub async fn place_order(
        &self,
        token: &str,
        product_id: Uuid,
        quantity: i32,
        payment_method: &str,
        promo_code: Option<&str>,
    ) -> Value {
        let (status, body) = self
            .request(
                Method::POST,
                "/api/v1/orders",
                Some(order_body(product_id, quantity, payment_method, promo_code)),
                Some(token),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "order creation failed: {body}");
        body["data"].clone()
    }
}

pub fn delivery_address() -> Value {
    serde_json::json!({
        "fullName": "Sita Sharma",
        "phone": "+977 9812345678",
        "city": "Kathmandu",
        "area": "Baneshwor",
        "nearestLandmark": "Near Everest Bank"
    })
}

pub fn order_body(
    product_id: Uuid,
    quantity: i32,
    payment_method: &str,
    promo_code: Option<&str>,
) -> Value {
    let mut body = serde_json::json!({
        "items": [{ "productId": product_id, "quantity": quantity }],
        "deliveryAddress": delivery_address(),
        "paymentMethod": payment_method,
    });
    if let Some(code) = promo_code {
        body["promoCode"] = Value::String(code.to_string());
    }
    body
}
