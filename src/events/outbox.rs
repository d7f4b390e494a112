//! Transactional outbox. Events are written in the same transaction as the state
//! change that produced them and dispatched to the [`NotificationSink`] later.

use crate::config::OutboxConfig;
use crate::entities::outbox_event::{
    self, STATUS_DELIVERED, STATUS_FAILED, STATUS_PENDING, STATUS_PROCESSING,
};
use crate::errors::ServiceError;
use crate::events::{Event, NotificationSink};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a claimed row stays invisible to other workers.
const CLAIM_LEASE_SECS: i64 = 60;
const MAX_BACKOFF_SECS: u64 = 300;

/// Enqueue a domain event into the outbox table. Call with the open transaction
/// of the write that produced the event.
pub async fn enqueue<C: ConnectionTrait>(db: &C, event: &Event) -> Result<Uuid, ServiceError> {
    let payload = serde_json::to_value(event)
        .map_err(|e| ServiceError::InternalError(format!("event serialization failed: {e}")))?;
    let (aggregate_type, aggregate_id) = event.aggregate();
    let id = Uuid::new_v4();
    let now = Utc::now();

    outbox_event::ActiveModel {
        id: Set(id),
        aggregate_type: Set(aggregate_type.to_string()),
        aggregate_id: Set(Some(aggregate_id)),
        event_type: Set(event.event_type().to_string()),
        payload: Set(payload),
        status: Set(STATUS_PENDING.to_string()),
        attempts: Set(0),
        last_error: Set(None),
        available_at: Set(now),
        created_at: Set(now),
        processed_at: Set(None),
    }
    .insert(db)
    .await
    .map_err(|e| {
        error!("failed to enqueue outbox event {}: {}", event.event_type(), e);
        ServiceError::DatabaseError(e)
    })?;

    debug!(
        "enqueued outbox event {} type={} agg={}:{}",
        id,
        event.event_type(),
        aggregate_type,
        aggregate_id
    );
    Ok(id)
}

/// Background worker that polls the outbox and dispatches to `sink`.
pub fn start_worker(
    db: Arc<DatabaseConnection>,
    sink: Arc<dyn NotificationSink>,
    config: OutboxConfig,
) -> JoinHandle<()> {
    info!(
        poll_interval_ms = config.poll_interval_ms,
        batch_size = config.batch_size,
        "starting outbox worker"
    );
    tokio::spawn(async move {
        loop {
            match drain_once(&db, sink.as_ref(), &config).await {
                Ok(0) => {}
                Ok(n) => debug!("outbox dispatched {} event(s)", n),
                Err(e) => error!("outbox worker error: {}", e),
            }
            sleep(Duration::from_millis(config.poll_interval_ms)).await;
        }
    })
}

/// Claims one batch of due events and dispatches them. Returns how many were delivered.
pub async fn drain_once(
    db: &DatabaseConnection,
    sink: &dyn NotificationSink,
    config: &OutboxConfig,
) -> Result<usize, ServiceError> {
    let now = Utc::now();

    // Rows left in `processing` past their lease belong to a worker that died.
    let due = outbox_event::Entity::find()
        .filter(
            outbox_event::Column::Status
                .is_in([STATUS_PENDING, STATUS_PROCESSING]),
        )
        .filter(outbox_event::Column::AvailableAt.lte(now))
        .order_by_asc(outbox_event::Column::CreatedAt)
        .limit(config.batch_size)
        .all(db)
        .await?;

    let mut delivered = 0;
    for row in due {
        if !claim(db, &row, now).await? {
            continue;
        }
        let attempts = row.attempts + 1;

        let event = match map_to_event(&row.event_type, &row.payload) {
            Some(event) => event,
            None => {
                warn!("outbox {} has unreadable payload for type {}", row.id, row.event_type);
                finish(db, row.id, STATUS_FAILED, Some("unreadable payload".into()), now).await?;
                continue;
            }
        };

        match sink.deliver(&event).await {
            Ok(()) => {
                finish(db, row.id, STATUS_DELIVERED, None, Utc::now()).await?;
                delivered += 1;
            }
            Err(e) if attempts >= config.max_attempts => {
                error!(
                    "outbox {} permanently failed after {} attempts: {}",
                    row.id, attempts, e
                );
                finish(db, row.id, STATUS_FAILED, Some(e.to_string()), Utc::now()).await?;
            }
            Err(e) => {
                let retry_at = Utc::now() + backoff(attempts);
                warn!(
                    "outbox {} dispatch failed (attempt {}), retrying at {}: {}",
                    row.id, attempts, retry_at, e
                );
                outbox_event::Entity::update_many()
                    .col_expr(outbox_event::Column::Status, Expr::value(STATUS_PENDING))
                    .col_expr(outbox_event::Column::AvailableAt, Expr::value(retry_at))
                    .col_expr(outbox_event::Column::LastError, Expr::value(e.to_string()))
                    .filter(outbox_event::Column::Id.eq(row.id))
                    .exec(db)
                    .await?;
            }
        }
    }

    Ok(delivered)
}

/// Compare-and-set claim on `(status, attempts)`; false if another worker got there first.
async fn claim(
    db: &DatabaseConnection,
    row: &outbox_event::Model,
    now: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let result = outbox_event::Entity::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(STATUS_PROCESSING))
        .col_expr(outbox_event::Column::Attempts, Expr::value(row.attempts + 1))
        .col_expr(
            outbox_event::Column::AvailableAt,
            Expr::value(now + ChronoDuration::seconds(CLAIM_LEASE_SECS)),
        )
        .filter(outbox_event::Column::Id.eq(row.id))
        .filter(outbox_event::Column::Status.eq(row.status.clone()))
        .filter(outbox_event::Column::Attempts.eq(row.attempts))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

async fn finish(
    db: &DatabaseConnection,
    id: Uuid,
    status: &str,
    last_error: Option<String>,
    at: DateTime<Utc>,
) -> Result<(), ServiceError> {
    outbox_event::Entity::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(status))
        .col_expr(outbox_event::Column::ProcessedAt, Expr::value(Some(at)))
        .col_expr(outbox_event::Column::LastError, Expr::value(last_error))
        .filter(outbox_event::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Rows not yet delivered, newest first.
pub async fn list_undelivered(
    db: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<outbox_event::Model>, ServiceError> {
    Ok(outbox_event::Entity::find()
        .filter(
            outbox_event::Column::Status.is_in([STATUS_PENDING, STATUS_PROCESSING, STATUS_FAILED]),
        )
        .order_by_desc(outbox_event::Column::CreatedAt)
        .limit(limit)
        .all(db)
        .await?)
}

/// Puts a failed row back in the queue with a fresh attempt budget.
pub async fn retry(db: &DatabaseConnection, id: Uuid) -> Result<(), ServiceError> {
    let result = outbox_event::Entity::update_many()
        .col_expr(outbox_event::Column::Status, Expr::value(STATUS_PENDING))
        .col_expr(outbox_event::Column::Attempts, Expr::value(0))
        .col_expr(outbox_event::Column::AvailableAt, Expr::value(Utc::now()))
        .col_expr(outbox_event::Column::LastError, Expr::value(Option::<String>::None))
        .col_expr(
            outbox_event::Column::ProcessedAt,
            Expr::value(Option::<DateTime<Utc>>::None),
        )
        .filter(outbox_event::Column::Id.eq(id))
        .filter(outbox_event::Column::Status.eq(STATUS_FAILED))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!(
            "No failed outbox event {id}"
        )));
    }
    info!(%id, "outbox event requeued");
    Ok(())
}

/// Exponential backoff (2^attempts seconds, capped) with up to one second of jitter.
pub fn backoff(attempts: i32) -> ChronoDuration {
    let exp = attempts.clamp(0, 16) as u32;
    let secs = 2u64.saturating_pow(exp).min(MAX_BACKOFF_SECS);
    let jitter_ms: i64 = rand::thread_rng().gen_range(0..1000);
    ChronoDuration::seconds(secs as i64) + ChronoDuration::milliseconds(jitter_ms)
}

fn map_to_event(event_type: &str, payload: &serde_json::Value) -> Option<Event> {
    let event: Event = serde_json::from_value(payload.clone()).ok()?;
    (event.event_type() == event_type).then_some(event)
}
