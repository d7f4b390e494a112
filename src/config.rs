use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_PAYMENT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Fallback delivery-fee schedule used when the settings store has no value.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Orders strictly above this amount (after discount) ship free.
    #[validate(custom = "validate_non_negative")]
    pub free_threshold: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub fee: Decimal,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            free_threshold: dec!(500),
            fee: dec!(50),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default)]
pub struct KhaltiConfig {
    #[validate(url)]
    pub base_url: String,
    pub secret_key: String,
    pub return_url: String,
    pub website_url: String,
}

impl Default for KhaltiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://khalti.com/api/v2".to_string(),
            secret_key: String::new(),
            return_url: "http://localhost:3000/payment/verify".to_string(),
            website_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default)]
pub struct EsewaConfig {
    #[validate(url)]
    pub api_url: String,
    /// Product code (`scd`) issued by eSewa.
    pub merchant_id: String,
    /// Shared HMAC secret for request and callback signatures.
    pub secret_key: String,
    pub success_url: String,
    pub failure_url: String,
    /// Confirm webhook payloads with eSewa's transaction lookup before marking paid.
    pub verify_with_provider: bool,
}

impl Default for EsewaConfig {
    fn default() -> Self {
        Self {
            api_url: "https://uat.esewa.com.np".to_string(),
            merchant_id: "EPAYTEST".to_string(),
            secret_key: String::new(),
            success_url: "http://localhost:8080/api/v1/payments/esewa/success".to_string(),
            failure_url: "http://localhost:8080/api/v1/payments/esewa/failure".to_string(),
            verify_with_provider: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(default)]
pub struct OutboxConfig {
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u64,
    #[validate(range(min = 1))]
    pub max_attempts: i32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            max_attempts: 8,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// HS256 secret shared with the identity service that issues tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Comma-separated list of allowed browser origins; empty allows any
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Browser-facing base URL that eSewa redirects land on
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,

    /// Upper bound on every outbound payment-provider call
    #[serde(default = "default_payment_timeout_ms")]
    #[validate(range(min = 1))]
    pub payment_timeout_ms: u64,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    #[validate]
    pub khalti: KhaltiConfig,

    #[serde(default)]
    #[validate]
    pub esewa: EsewaConfig,

    #[serde(default)]
    #[validate]
    pub outbox: OutboxConfig,
}

impl AppConfig {
    /// Builds a configuration programmatically with defaults for everything optional.
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            cors_allowed_origins: None,
            frontend_url: default_frontend_url(),
            payment_timeout_ms: default_payment_timeout_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            delivery: DeliveryConfig::default(),
            khalti: KhaltiConfig::default(),
            esewa: EsewaConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }

    /// Checks that only matter outside development.
    pub fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.is_production() {
            if self.esewa.secret_key.is_empty() {
                errors.add(
                    "esewa",
                    ValidationError::new("esewa.secret_key is required in production"),
                );
            }
            if self.khalti.secret_key.is_empty() {
                errors.add(
                    "khalti",
                    ValidationError::new("khalti.secret_key is required in production"),
                );
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() {
        return Err(ValidationError::new("must_be_non_negative"));
    }
    Ok(())
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}

fn default_db_min_connections() -> u32 {
    2
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_payment_timeout_ms() -> u64 {
    DEFAULT_PAYMENT_TIMEOUT_MS
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

/// Initializes the global tracing subscriber.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("momosewa_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);
    let filter = EnvFilter::new(filter_directive);

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

fn load_config_from(dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    let config = Config::builder()
        .set_default("database_url", "sqlite://momosewa.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(dir.join("default")).required(false))
        .add_source(File::from(dir.join(run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    // jwt_secret has no default; tokens from the identity service cannot be verified without it.
    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET (minimum 32 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
