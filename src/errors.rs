use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{error::DbErr, SqlErr};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

/// One structural problem with a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    #[schema(example = "items[0].quantity")]
    pub field: String,
    #[schema(example = "Quantity must be at least 1")]
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error envelope shared by every JSON endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "success": false,
    "message": "Order cannot be cancelled at this stage"
}))]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    ValidationError(String),

    #[error("{0}")]
    InvalidStatus(String),

    #[error("{0}")]
    InsufficientStock(String),

    /// A provider-side rejection: bad signature, amount mismatch, incomplete payment.
    #[error("{0}")]
    PaymentRejected(String),

    #[error("Validation failed")]
    StructuralInvalid(Vec<FieldError>),

    #[error("{0}")]
    Conflict(String),

    #[error("Payment provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<FieldError> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let message = match (&e.message, e.code.as_ref()) {
                        (Some(m), _) => m.to_string(),
                        (None, "required") => format!("{} is required", humanize(field)),
                        (None, _) => format!("Invalid value for {}", camel_case(field)),
                    };
                    FieldError::new(camel_case(field), message)
                })
            })
            .collect();
        fields.sort_by(|a, b| a.field.cmp(&b.field));
        ServiceError::StructuralInvalid(fields)
    }
}

/// `order_total` -> `Order total`.
fn humanize(field: &str) -> String {
    let words = field.replace('_', " ");
    let mut chars = words.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => words,
    }
}

/// Request bodies are camelCase on the wire; validator reports Rust field names.
pub(crate) fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for ch in field.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

impl ServiceError {
    /// Maps a unique-index violation to `Conflict`, everything else to `DatabaseError`.
    pub fn from_write(err: DbErr, conflict_message: &str) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                ServiceError::Conflict(conflict_message.to_string())
            }
            _ => ServiceError::DatabaseError(err),
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ValidationError(_)
            | Self::InvalidStatus(_)
            | Self::InsufficientStock(_)
            | Self::PaymentRejected(_) => StatusCode::BAD_REQUEST,
            Self::StructuralInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => "Payment provider request failed".to_string(),
            Self::ProviderTimeout(_) => {
                "Payment provider did not respond in time; please retry".to_string()
            }
            _ => self.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTimeout(_))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }

        let details = match &self {
            Self::StructuralInvalid(fields) => Some(fields.clone()),
            _ => None,
        };
        let body = ErrorResponse {
            success: false,
            message: self.response_message(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rstest::rstest;
    use validator::Validate;

    #[rstest]
    #[case(ServiceError::NotFound("Order not found".into()), StatusCode::NOT_FOUND)]
    #[case(ServiceError::Forbidden("nope".into()), StatusCode::FORBIDDEN)]
    #[case(ServiceError::Unauthorized("token".into()), StatusCode::UNAUTHORIZED)]
    #[case(ServiceError::ValidationError("bad".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::InvalidStatus("bad".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::InsufficientStock("low".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::PaymentRejected("sig".into()), StatusCode::BAD_REQUEST)]
    #[case(ServiceError::StructuralInvalid(vec![]), StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(ServiceError::Conflict("dup".into()), StatusCode::CONFLICT)]
    #[case(ServiceError::ProviderTimeout("esewa".into()), StatusCode::GATEWAY_TIMEOUT)]
    #[case(ServiceError::ExternalServiceError("khalti".into()), StatusCode::BAD_GATEWAY)]
    #[case(ServiceError::InternalError("boom".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    fn maps_status_codes(#[case] err: ServiceError, #[case] expected: StatusCode) {
        assert_eq!(err.status_code(), expected);
    }

    #[test]
    fn database_errors_are_sanitized() {
        let err = ServiceError::DatabaseError(DbErr::Custom("relation orders missing".into()));
        assert_eq!(err.response_message(), "Internal server error");
    }

    #[tokio::test]
    async fn structural_errors_carry_details() {
        let err = ServiceError::StructuralInvalid(vec![FieldError::new(
            "deliveryAddress.phone",
            "Phone is required",
        )]);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["details"][0]["field"], "deliveryAddress.phone");
        assert_eq!(json["details"][0]["message"], "Phone is required");
    }

    #[derive(Validate)]
    struct QuoteForm {
        #[validate(length(min = 1, message = "Code is required"))]
        code: String,
        #[validate(range(min = 0.0, message = "Order total must be non-negative"))]
        order_total: f64,
    }

    #[test]
    fn validator_errors_become_camel_case_field_errors() {
        let form = QuoteForm {
            code: String::new(),
            order_total: -1.0,
        };
        let err: ServiceError = form.validate().unwrap_err().into();
        match err {
            ServiceError::StructuralInvalid(fields) => {
                assert_eq!(
                    fields,
                    vec![
                        FieldError::new("code", "Code is required"),
                        FieldError::new("orderTotal", "Order total must be non-negative"),
                    ]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[derive(Validate)]
    struct PreviewForm {
        #[validate(required)]
        order_total: Option<f64>,
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let err: ServiceError = PreviewForm { order_total: None }
            .validate()
            .unwrap_err()
            .into();
        match err {
            ServiceError::StructuralInvalid(fields) => {
                assert_eq!(
                    fields,
                    vec![FieldError::new("orderTotal", "Order total is required")]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
