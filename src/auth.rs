//! Bearer-token identity. Tokens are issued by the separate identity service;
//! this crate only verifies them and exposes the caller as [`AuthUser`].

use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Customer,
    Vendor,
    Admin,
}

/// Claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub role: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_vendor(&self) -> bool {
        self.role == Role::Vendor
    }

    pub fn is_customer(&self) -> bool {
        self.role == Role::Customer
    }
}

/// HS256 token verifier shared through application state.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, ServiceError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            warn!("Rejected bearer token: {}", e);
            ServiceError::Unauthorized("Invalid or expired token".to_string())
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ServiceError::Unauthorized("Invalid token subject".to_string()))?;
        let role = data
            .claims
            .role
            .parse::<Role>()
            .map_err(|_| ServiceError::Unauthorized("Invalid token role".to_string()))?;

        Ok(AuthUser { user_id, role })
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<JwtVerifier>::from_ref(state);

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("Authentication required".to_string()))?;

        verifier.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit_test_secret_that_is_at_least_32_chars";

    fn token(sub: &str, role: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            role: role.to_string(),
            exp: now + exp_offset,
            iat: now,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_valid_token() {
        let id = Uuid::new_v4();
        let verifier = JwtVerifier::new(SECRET);
        let user = verifier.verify(&token(&id.to_string(), "vendor", 600)).unwrap();
        assert_eq!(user, AuthUser::new(id, Role::Vendor));
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = JwtVerifier::new(SECRET);
        let err = verifier
            .verify(&token(&Uuid::new_v4().to_string(), "customer", -3600))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    #[test]
    fn rejects_unknown_role() {
        let verifier = JwtVerifier::new(SECRET);
        let err = verifier
            .verify(&token(&Uuid::new_v4().to_string(), "courier", 600))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = JwtVerifier::new("another_secret_that_is_at_least_32_chars!");
        assert!(verifier
            .verify(&token(&Uuid::new_v4().to_string(), "admin", 600))
            .is_err());
    }
}
