//! WebSocket hub: one socket is one presence connection.
//!
//! The socket subscribes to its `push:{connection_id}` channel before it is
//! registered, so a dispatcher never sees the user online without a listener.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use herald_common::presence::push_channel;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub user_id: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.user_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({ "error": "userId is required" })),
        )
            .into_response();
    }
    let Some(client) = state.pubsub.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "error": "live push is not configured" })),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| ws_connection(socket, state, client, params.user_id))
        .into_response()
}

async fn ws_connection(mut socket: WebSocket, state: AppState, client: redis::Client, user_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    let channel = push_channel(&connection_id);

    let mut pubsub = match client.get_async_pubsub().await {
        Ok(pubsub) => pubsub,
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Failed to open pub/sub connection");
            return;
        }
    };
    if let Err(e) = pubsub.subscribe(&channel).await {
        tracing::error!(user_id = %user_id, error = %e, "Failed to subscribe to push channel");
        return;
    }
    if let Err(e) = state.presence.connect(&user_id, &connection_id).await {
        tracing::error!(user_id = %user_id, error = %e, "Failed to register connection");
        return;
    }
    tracing::info!(user_id = %user_id, connection_id = %connection_id, "Socket connected");

    let hello = json!({ "type": "connected", "connectionId": connection_id }).to_string();
    if socket.send(WsMessage::Text(hello.into())).await.is_ok() {
        let mut pushes = pubsub.on_message();
        loop {
            tokio::select! {
                msg = pushes.next() => {
                    let Some(msg) = msg else { break };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(connection_id = %connection_id, error = %e, "Undecodable push");
                            continue;
                        }
                    };
                    if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = socket.send(WsMessage::Pong(data)).await;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    if let Err(e) = state.presence.disconnect(&connection_id).await {
        tracing::warn!(connection_id = %connection_id, error = %e, "Failed to unregister connection");
    }
    tracing::info!(user_id = %user_id, connection_id = %connection_id, "Socket disconnected");
}
