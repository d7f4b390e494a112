use crate::errors::{FieldError, ServiceError};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;
use validator::Validate;

/// JSON body that has been deserialized and run through `validator`.
///
/// Malformed JSON and rule violations both surface as a 422 field list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(json_rejection)?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

/// Body-shape problems become a single `body` field error.
pub fn json_rejection(rejection: JsonRejection) -> ServiceError {
    ServiceError::StructuralInvalid(vec![FieldError::new("body", rejection.body_text())])
}

pub fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ServiceError::NotFound(format!("{what} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_ids_read_as_missing() {
        assert!(matches!(
            parse_uuid("not-a-uuid", "Order"),
            Err(ServiceError::NotFound(msg)) if msg == "Order not found"
        ));
        assert!(parse_uuid(&Uuid::new_v4().to_string(), "Order").is_ok());
    }
}
