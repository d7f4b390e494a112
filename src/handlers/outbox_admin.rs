use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::parse_uuid;
use crate::auth::AuthUser;
use crate::entities::outbox_event;
use crate::events::outbox;
use crate::{errors::ServiceError, ApiResponse, AppState};

const LIST_LIMIT: u64 = 100;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Option<Uuid>,
    pub event_type: String,
    pub status: String,
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<outbox_event::Model> for OutboxItem {
    fn from(row: outbox_event::Model) -> Self {
        Self {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            status: row.status,
            attempts: row.attempts,
            available_at: row.available_at,
            created_at: row.created_at,
            last_error: row.last_error,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_outbox))
        .route("/:id/retry", post(retry_outbox))
}

fn require_admin(user: &AuthUser) -> Result<(), ServiceError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Admin access required".to_string()))
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/outbox",
    responses(
        (status = 200, description = "Undelivered notification events", body = ApiResponse<Vec<OutboxItem>>),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn list_outbox(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<OutboxItem>>>, ServiceError> {
    require_admin(&user)?;
    let rows = outbox::list_undelivered(&state.db, LIST_LIMIT).await?;
    Ok(Json(ApiResponse::success(
        rows.into_iter().map(OutboxItem::from).collect(),
    )))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/outbox/{id}/retry",
    params(("id" = String, Path, description = "Outbox event id")),
    responses(
        (status = 200, description = "Event scheduled for retry"),
        (status = 403, description = "Admins only", body = crate::errors::ErrorResponse),
        (status = 404, description = "No failed event with this id", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn retry_outbox(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, ServiceError> {
    require_admin(&user)?;
    let id = parse_uuid(&id, "Outbox event")?;
    outbox::retry(&state.db, id).await?;
    Ok(Json(ApiResponse::message("Event scheduled for retry")))
}
