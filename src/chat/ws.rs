use axum::{
    Extension, debug_handler,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{AppState, auth::Identity, chat, events::GroupEvent, groups::Subscriber};

#[derive(Debug, Deserialize)]
struct SendFrame {
    message: String,
    receiver_id: i64,
}

#[derive(Debug, Deserialize)]
struct ReadFrame {
    action: String,
    message_id: i64,
}

#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    Path(room_id): Path<i64>,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.config.chat_requires_auth && identity.is_anonymous() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| chat_session(socket, state, identity, room_id))
}

async fn chat_session(socket: WebSocket, state: AppState, identity: Identity, room_id: i64) {
    let group = format!("chat_{room_id}");
    let conn_id = Uuid::now_v7();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.groups.join(&group, Subscriber::new(conn_id, tx)).await;

    let (mut sender, mut receiver) = socket.split();
    let forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if sender.send(Message::from(event.to_wire())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = receiver.next().await {
        let data = frame.into_data();

        if let Ok(read) = serde_json::from_slice::<ReadFrame>(&data) {
            if read.action != "read" {
                continue;
            }
            let Identity::User(user) = &identity else {
                continue;
            };
            match chat::store::mark_read(&state.db_pool, read.message_id, user.id).await {
                Ok(true) => {
                    let receipt = GroupEvent::ReadReceipt {
                        message_id: read.message_id,
                        reader_id: user.id,
                    };
                    if let Err(err) = state.groups.broadcast(&group, receipt).await {
                        error!("read receipt fan-out to {group} failed: {err:#}");
                    }
                }
                // unknown message, someone else's message or already read:
                // no state change, no receipt
                Ok(false) => {}
                Err(err) => {
                    error!("marking message {} read failed: {err:?}", read.message_id);
                    break;
                }
            }
            continue;
        }

        let Ok(send) = serde_json::from_slice::<SendFrame>(&data) else {
            continue;
        };
        let Identity::User(user) = &identity else {
            debug!("dropping send frame from anonymous connection");
            continue;
        };
        if let Err(err) =
            chat::send_message(&state, user, send.receiver_id, &send.message, Some(room_id)).await
        {
            // nothing was broadcast, so closing leaves no half-delivered state
            error!("persisting chat message failed: {err:?}");
            break;
        }
    }

    state.groups.leave(&group, conn_id).await;
    forward.abort();
}
