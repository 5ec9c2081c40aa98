pub mod store;
pub mod ws;

use std::collections::HashMap;

use axum::{
    Extension, Json, Router, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use crate::{
    AppState,
    appresult::{AppError, AppResult},
    auth::{CurrentUser, Identity},
    events::GroupEvent,
    notifications,
};
use store::{Message, Room};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/room/{user_id}", get(room_with_user))
        .route("/messages/{room_id}", get(message_history))
        .route("/send", post(send))
}

/// The send operation shared by the websocket and HTTP paths. The broadcast
/// only happens after `append_message` returns, so nothing reaches a room
/// that is not already durable; fan-out and notification failures are
/// delivery gaps, logged but never grounds to undo the write.
pub(crate) async fn send_message(
    state: &AppState,
    sender: &CurrentUser,
    receiver_id: i64,
    body: &str,
    connected_room: Option<i64>,
) -> AppResult<(Message, Room)> {
    let (message, room) = store::append_message(&state.db_pool, sender.id, receiver_id, body).await?;

    let target = connected_room.unwrap_or(room.id);
    let event = GroupEvent::ChatMessage {
        message: message.body.clone(),
        sender_id: sender.id,
        sender_username: sender.username.clone(),
        timestamp: message.created_at.clone(),
        message_id: message.id,
    };
    if let Err(err) = state.groups.broadcast(&format!("chat_{target}"), event).await {
        warn!("chat fan-out to chat_{target} failed: {err:#}");
    }

    if let Err(err) = notifications::notify_new_message(state, sender, &message, room.id).await {
        warn!("notification delivery for message {} failed: {err:?}", message.id);
    }

    Ok((message, room))
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct UserOut {
    id: i64,
    username: String,
    role: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageOut {
    id: i64,
    sender: UserOut,
    receiver: UserOut,
    message: String,
    timestamp: String,
    is_read: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomOut {
    id: i64,
    participants: Vec<UserOut>,
    created_at: String,
    last_message: Option<MessageOut>,
}

pub(crate) async fn fetch_user(db_pool: &SqlitePool, user_id: i64) -> AppResult<Option<UserOut>> {
    let row: Option<(i64, String, String)> =
        sqlx::query_as("SELECT id,username,role FROM users WHERE id=?")
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?;
    Ok(row.map(|(id, username, role)| UserOut { id, username, role }))
}

fn message_out(message: &Message, sender: &UserOut, receiver: &UserOut) -> MessageOut {
    MessageOut {
        id: message.id,
        sender: sender.clone(),
        receiver: receiver.clone(),
        message: message.body.clone(),
        timestamp: message.created_at.clone(),
        is_read: message.is_read,
    }
}

async fn message_out_by_id(db_pool: &SqlitePool, message_id: i64) -> AppResult<Option<MessageOut>> {
    let row: Option<(i64, i64, i64, String, String, bool)> = sqlx::query_as(
        "SELECT id,sender_id,receiver_id,body,created_at,is_read FROM messages WHERE id=?",
    )
    .bind(message_id)
    .fetch_optional(db_pool)
    .await?;
    let Some((id, sender_id, receiver_id, body, created_at, is_read)) = row else {
        return Ok(None);
    };
    let (Some(sender), Some(receiver)) = (
        fetch_user(db_pool, sender_id).await?,
        fetch_user(db_pool, receiver_id).await?,
    ) else {
        return Ok(None);
    };
    Ok(Some(MessageOut {
        id,
        sender,
        receiver,
        message: body,
        timestamp: created_at,
        is_read,
    }))
}

async fn room_out(db_pool: &SqlitePool, room: &Room) -> AppResult<RoomOut> {
    let mut participants = Vec::new();
    for user_id in room.participant_ids() {
        if let Some(user) = fetch_user(db_pool, user_id).await? {
            participants.push(user);
        }
    }
    let last_message = match room.last_message_id {
        Some(message_id) => message_out_by_id(db_pool, message_id).await?,
        None => None,
    };
    Ok(RoomOut {
        id: room.id,
        participants,
        created_at: room.created_at.clone(),
        last_message,
    })
}

#[debug_handler(state = crate::AppState)]
async fn list_rooms(
    State(db_pool): State<SqlitePool>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Vec<RoomOut>>> {
    let user = identity.user()?;
    let rooms = store::rooms_for_user(&db_pool, user.id).await?;
    let mut out = Vec::with_capacity(rooms.len());
    for room in &rooms {
        out.push(room_out(&db_pool, room).await?);
    }
    Ok(Json(out))
}

#[debug_handler(state = crate::AppState)]
async fn room_with_user(
    State(db_pool): State<SqlitePool>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<RoomOut>> {
    let user = identity.user()?;
    if fetch_user(&db_pool, user_id).await?.is_none() {
        return Err(AppError::NotFound("User not found"));
    }
    let room = store::get_or_create_room(&db_pool, user.id, user_id).await?;
    Ok(Json(room_out(&db_pool, &room).await?))
}

#[debug_handler(state = crate::AppState)]
async fn message_history(
    State(db_pool): State<SqlitePool>,
    Extension(identity): Extension<Identity>,
    Path(room_id): Path<i64>,
) -> AppResult<Json<Vec<MessageOut>>> {
    let user = identity.user()?;
    // a room you are not in is indistinguishable from one that doesn't exist
    let room = store::room_by_id(&db_pool, room_id)
        .await?
        .filter(|room| room.has_participant(user.id))
        .ok_or(AppError::NotFound("Chat room not found"))?;

    let mut users = HashMap::new();
    for user_id in room.participant_ids() {
        if let Some(found) = fetch_user(&db_pool, user_id).await? {
            users.insert(user_id, found);
        }
    }

    let messages = store::messages_for_room(&db_pool, &room).await?;
    let mut out = Vec::with_capacity(messages.len());
    for message in &messages {
        let (Some(sender), Some(receiver)) =
            (users.get(&message.sender_id), users.get(&message.receiver_id))
        else {
            continue;
        };
        out.push(message_out(message, sender, receiver));
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    receiver_id: i64,
    message: String,
}

#[debug_handler(state = crate::AppState)]
async fn send(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<SendBody>,
) -> AppResult<Response> {
    let user = identity.user()?.clone();
    let Some(receiver) = fetch_user(&state.db_pool, body.receiver_id).await? else {
        return Err(AppError::NotFound("Receiver not found"));
    };
    let Some(sender) = fetch_user(&state.db_pool, user.id).await? else {
        return Err(AppError::NotFound("User not found"));
    };

    let (message, _room) = send_message(&state, &user, body.receiver_id, &body.message, None).await?;
    Ok((StatusCode::CREATED, Json(message_out(&message, &sender, &receiver))).into_response())
}
