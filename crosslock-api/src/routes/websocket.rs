use std::str::FromStr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crosslock_core::swap::SwapStatus;
use crosslock_core::{PushMessage, PushMessageType, SwapSession};

use crate::models::ClientMessage;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (client_id, mut outbound) = state.hub.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound pump: hub queue -> socket. Owns the write half; a failed
    // write ends the session.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let welcome = PushMessage::new(
        PushMessageType::Heartbeat,
        serde_json::json!({
            "message": "connected",
            "client_id": client_id,
            "topics": ["swap_updates", "htlc_events", "system_events", "withdrawal_events"],
        }),
    );
    state.hub.send_to(&client_id, welcome);

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.hub.touch(&client_id);
                handle_client_message(&state, &client_id, &text).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                state.hub.touch(&client_id);
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.hub.unregister(&client_id);
    writer.abort();
}

async fn handle_client_message(state: &Arc<AppState>, client_id: &Uuid, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            state
                .hub
                .send_to(client_id, PushMessage::error(format!("bad message: {e}")));
            return;
        }
    };

    let result = match message {
        ClientMessage::Subscribe { topics } => {
            state.hub.subscribe_topics(client_id, &topics).map(|_| None)
        }
        ClientMessage::Unsubscribe { topics } => state
            .hub
            .unsubscribe_topics(client_id, &topics)
            .map(|_| None),
        ClientMessage::SubscribeSwap { swap_id } => state
            .hub
            .subscribe_swap(client_id, &swap_id)
            .map(|_| {
                Some(PushMessage::new(
                    PushMessageType::SwapSubscribed,
                    serde_json::json!({ "swap_id": swap_id }),
                ))
            }),
        ClientMessage::UnsubscribeSwap { swap_id } => state
            .hub
            .unsubscribe_swap(client_id, &swap_id)
            .map(|_| {
                Some(PushMessage::new(
                    PushMessageType::SwapUnsubscribed,
                    serde_json::json!({ "swap_id": swap_id }),
                ))
            }),
        ClientMessage::GetSwaps { status, limit } => {
            match query_swaps(state, status, limit).await {
                Ok(swaps) => Ok(Some(PushMessage::new(
                    PushMessageType::SwapUpdated,
                    serde_json::json!({ "swaps": swaps }),
                ))),
                Err(e) => Err(e),
            }
        }
        ClientMessage::GetSwap { swap_id } => match lookup_swap(state, &swap_id).await {
            Ok(Some(swap)) => Ok(Some(PushMessage::new(
                PushMessageType::SwapUpdated,
                serde_json::json!({ "swap": swap }),
            ))),
            Ok(None) => Err(crosslock_core::RelayerError::SwapNotFound(swap_id)),
            Err(e) => Err(e),
        },
        ClientMessage::Pong => Ok(None),
    };

    match result {
        Ok(Some(reply)) => state.hub.send_to(client_id, reply),
        Ok(None) => {}
        Err(e) => state.hub.send_to(client_id, PushMessage::error(e.to_string())),
    }
}

async fn query_swaps(
    state: &Arc<AppState>,
    status: Option<String>,
    limit: Option<i64>,
) -> Result<Vec<SwapSession>, crosslock_core::RelayerError> {
    let status = status.as_deref().map(SwapStatus::from_str).transpose()?;
    let limit = limit.unwrap_or(50).clamp(1, 500);
    state.storage.list_swaps(status, limit, 0).await
}

async fn lookup_swap(
    state: &Arc<AppState>,
    swap_id: &str,
) -> Result<Option<SwapSession>, crosslock_core::RelayerError> {
    if let Some(swap) = state.cache.get_swap(swap_id) {
        return Ok(Some(swap));
    }
    state.storage.load_swap(swap_id).await
}
