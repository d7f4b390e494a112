//! MomoSewa API library
//!
//! Order lifecycle, promo codes, delivery fees and Khalti/eSewa payment reconciliation
//! for a multi-vendor food-delivery marketplace.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod openapi;
pub mod services;
pub mod telemetry;

use axum::{
    extract::{FromRef, State},
    http::HeaderValue,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::auth::JwtVerifier;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::handlers::AppServices;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub jwt: Arc<JwtVerifier>,
    pub services: AppServices,
}

impl AppState {
    pub fn new(db: Arc<DbPool>, config: AppConfig) -> Result<Self, ServiceError> {
        let services = AppServices::new(db.clone(), &config)?;
        let jwt = Arc::new(JwtVerifier::new(&config.jwt_secret));
        Ok(Self {
            db,
            config,
            jwt,
            services,
        })
    }
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

/// Success envelope shared by every endpoint. Errors use [`errors::ErrorResponse`].
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let payments = handlers::payments::payment_routes()
        .merge(handlers::payment_webhooks::esewa_public_routes());

    Router::new()
        .route("/health", get(health_check))
        .nest("/orders", handlers::orders::orders_routes())
        .nest("/payments", payments)
        .nest("/promo-codes", handlers::promotions::promo_code_routes())
        .nest("/delivery-fee", handlers::delivery_fee::delivery_fee_routes())
        .nest(
            "/admin/delivery-fee",
            handlers::delivery_fee::admin_delivery_fee_routes(),
        )
        .nest("/admin/outbox", handlers::outbox_admin::router())
}

/// Full application router: versioned API, docs, request ids, tracing and CORS.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(|| async { "momosewa-api up" }))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(telemetry::configure_http_tracing())
        .layer(telemetry::propagate_request_id())
        .layer(telemetry::set_request_id())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        info!("No CORS origins configured; allowing any origin");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthChecks {
    pub database: &'static str,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: HealthChecks,
    pub timestamp: String,
}

/// Liveness plus database reachability
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses((status = 200, description = "Service health", body = ApiResponse<HealthStatus>)),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> ApiResult<HealthStatus> {
    let database = match state.db.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            warn!("database ping failed: {}", e);
            "unhealthy"
        }
    };

    Ok(Json(ApiResponse::success(HealthStatus {
        status: if database == "healthy" { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        checks: HealthChecks { database },
        timestamp: chrono::Utc::now().to_rfc3339(),
    })))
}
