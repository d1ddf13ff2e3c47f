//! Intake and query routes for notifications.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Notification, NotificationEvent};

use crate::state::AppState;

const DEFAULT_PENDING_LIMIT: i64 = 100;
const MAX_PENDING_LIMIT: i64 = 1000;
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;
const MAX_BATCH: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(publish_notification))
        .route("/api/notifications/batch", post(publish_batch))
        .route("/api/notifications/pending", get(list_pending))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/read", post(mark_read))
        .route("/api/users/{user_id}/notifications", get(list_for_user))
        .route(
            "/api/users/{user_id}/notifications/unread-count",
            get(unread_count),
        )
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub notifications: Vec<NotificationEvent>,
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// POST /api/notifications: Validate one event and publish it to the intake queue.
async fn publish_notification(
    State(state): State<AppState>,
    Json(event): Json<NotificationEvent>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    event.validate()?;
    let payload = serde_json::to_string(&event)?;
    let message_id = state.queue.publish(&payload).await?;

    tracing::debug!(user_id = %event.user_id, message_id = %message_id, "Event queued");
    Ok((StatusCode::ACCEPTED, Json(json!({ "messageId": message_id }))))
}

/// POST /api/notifications/batch: All-or-nothing validation, then publish in order.
async fn publish_batch(
    State(state): State<AppState>,
    Json(batch): Json<BatchRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if batch.notifications.is_empty() {
        return Err(AppError::Validation("notifications must not be empty".to_string()));
    }
    if batch.notifications.len() > MAX_BATCH {
        return Err(AppError::Validation(format!(
            "at most {} notifications per batch",
            MAX_BATCH
        )));
    }
    for (index, event) in batch.notifications.iter().enumerate() {
        event
            .validate()
            .map_err(|e| AppError::Validation(format!("notifications[{}]: {}", index, e)))?;
    }

    let mut message_ids = Vec::with_capacity(batch.notifications.len());
    for event in &batch.notifications {
        let payload = serde_json::to_string(event)?;
        message_ids.push(state.queue.publish(&payload).await?);
    }

    tracing::info!(count = message_ids.len(), "Batch queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "messageIds": message_ids })),
    ))
}

/// GET /api/notifications/pending: Records awaiting their first delivery attempt.
async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PENDING_LIMIT)
        .clamp(1, MAX_PENDING_LIMIT);
    let pending = state.store.pending(limit).await?;
    Ok(Json(pending))
}

/// GET /api/notifications/:id: One record, including its delivery status and last error.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
}

/// POST /api/notifications/:id/read
async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.store.mark_read(id).await? {
        Ok(Json(json!({ "read": true })))
    } else {
        Err(AppError::NotFound(format!("Notification {} not found", id)))
    }
}

/// GET /api/users/:userId/notifications: Newest first, paged.
async fn list_for_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let notifications = state.store.list_for_user(&user_id, page, page_size).await?;
    Ok(Json(notifications))
}

/// GET /api/users/:userId/notifications/unread-count
async fn unread_count(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = state.store.unread_count(&user_id).await?;
    Ok(Json(json!({ "userId": user_id, "unreadCount": count })))
}
