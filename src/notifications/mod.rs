pub mod store;
pub mod ws;

use axum::{
    Extension, Json, Router, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use serde_json::{Value, json};
use sqlx::SqlitePool;

use crate::{
    AppState,
    appresult::{AppError, AppResult},
    auth::{CurrentUser, Identity},
    chat::store::Message,
    events::GroupEvent,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list))
        .route("/api/notifications/{id}/read", patch(mark_read))
        .route("/api/notifications/mark-all-read", post(mark_all_read))
        .route("/api/notifications/{id}", delete(remove))
}

/// Delivery trigger for a freshly persisted chat message: record a
/// notification for the receiver, then push it to their private group.
/// Callers treat failures here as a delivery gap, not a send failure.
pub(crate) async fn notify_new_message(
    state: &AppState,
    sender: &CurrentUser,
    message: &Message,
    room_id: i64,
) -> AppResult<()> {
    let title = format!("New message from {}", sender.username);
    let data = json!({
        "room_id": room_id,
        "sender_id": sender.id,
        "message_id": message.id,
    });
    let notification =
        store::create(&state.db_pool, message.receiver_id, &title, &message.body, &data).await?;

    let event = GroupEvent::Notify { payload: notification.payload()? };
    state
        .groups
        .broadcast(&format!("user_{}", message.receiver_id), event)
        .await?;
    Ok(())
}

#[debug_handler(state = crate::AppState)]
async fn list(
    State(db_pool): State<SqlitePool>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Value>> {
    let user = identity.user()?;
    let notifications = store::list_for_user(&db_pool, user.id).await?;
    let unread_count = store::unread_count(&db_pool, user.id).await?;
    let mut results = Vec::with_capacity(notifications.len());
    for notification in &notifications {
        results.push(notification.payload()?);
    }
    Ok(Json(json!({ "results": results, "unread_count": unread_count })))
}

#[debug_handler(state = crate::AppState)]
async fn mark_read(
    State(db_pool): State<SqlitePool>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let user = identity.user()?;
    if !store::mark_read(&db_pool, id, user.id).await? {
        return Err(AppError::NotFound("Not found"));
    }
    Ok(Json(json!({ "detail": "Marked as read" })))
}

#[debug_handler(state = crate::AppState)]
async fn mark_all_read(
    State(db_pool): State<SqlitePool>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Value>> {
    let user = identity.user()?;
    store::mark_all_read(&db_pool, user.id).await?;
    Ok(Json(json!({ "detail": "All marked as read" })))
}

#[debug_handler(state = crate::AppState)]
async fn remove(
    State(db_pool): State<SqlitePool>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let user = identity.user()?;
    if !store::delete(&db_pool, id, user.id).await? {
        return Err(AppError::NotFound("Not found"));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}
