use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use termrelay_protocol::ClientMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.client_ids.next();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    state.front_end.client_connected(client_id, tx);

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(client_id, error = %e, "failed to encode server message");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    debug!(client_id, error = %e, "websocket write failed");
                    break;
                }
            }
            frame = ws_rx.next() => {
                let Some(frame) = frame else {
                    break;
                };
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(msg) => state.front_end.client_message(client_id, msg),
                        Err(e) => {
                            warn!(client_id, error = %e, "unparseable client message dropped");
                        }
                    },
                    Ok(Message::Binary(bytes)) => {
                        debug!(client_id, len = bytes.len(), "binary frame ignored");
                    }
                    Ok(Message::Ping(v)) => {
                        if ws_tx.send(Message::Pong(v)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        debug!(client_id, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.front_end.client_closed(client_id);
    info!(client_id, "websocket closed");
}
