use axum::{
    Extension, debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    AppState,
    auth::{CurrentUser, Identity},
    groups::Subscriber,
};

/// Private push channel. Unlike chat, this path is never anonymous: the
/// handshake is refused outright, before any group membership exists.
#[debug_handler(state = crate::AppState)]
pub async fn notifications_ws(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> Response {
    let Identity::User(user) = identity else {
        return StatusCode::FORBIDDEN.into_response();
    };
    ws.on_upgrade(move |socket| notification_session(socket, state, user))
}

async fn notification_session(socket: WebSocket, state: AppState, user: CurrentUser) {
    let group = format!("user_{}", user.id);
    let conn_id = Uuid::now_v7();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.groups.join(&group, Subscriber::new(conn_id, tx)).await;

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if sender.send(Message::from(event.to_wire())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = receiver.next() => match frame {
                // the protocol defines no client-originated events
                Some(Ok(_)) => continue,
                _ => break,
            },
        }
    }

    state.groups.leave(&group, conn_id).await;
}
