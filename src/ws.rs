//! Live viewer connections.
//!
//! Each socket is served by one task: outbound messages arrive from the
//! broadcaster through the viewer's queue and are written by a companion
//! writer task, inbound frames are parsed into [`ClientMessage`] and handed to
//! the same hub commands the HTTP API uses.

use crate::broadcaster::ViewerId;
use crate::hub::DebugHub;
use crate::main_helper::AppState;
use crate::protocol::{ClientMessage, ServerMessage};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| viewer_session(socket, state))
}

async fn viewer_session(socket: WebSocket, state: AppState) {
    let hub = state.hub.clone();
    let (id, outbound) = hub.viewers.register();
    tracing::info!(%id, "Viewer connected");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_outbound(id, sink, outbound));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_viewer_text(&hub, id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%id, "Viewer socket error: {}", e);
                break;
            }
        }
    }

    hub.viewers.unregister(id);
    writer.abort();
    tracing::info!(%id, "Viewer disconnected");
}

async fn write_outbound(
    id: ViewerId,
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(%id, "Failed to encode viewer message: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

/// Parses and dispatches one text frame. Malformed frames are logged and
/// dropped; the connection stays open.
pub async fn handle_viewer_text(hub: &DebugHub, id: ViewerId, text: &str) {
    match ClientMessage::parse(text) {
        Ok(message) => {
            tracing::debug!(%id, ?message, "Viewer message");
            hub.handle_viewer_message(id, message).await;
        }
        Err(e) => {
            tracing::warn!(%id, "{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_state::DebugStateController;
    use crate::log_store::LogStoreConfig;
    use crate::types::DebugState;

    #[tokio::test]
    async fn test_malformed_text_is_ignored() {
        let hub = DebugHub::new(
            DebugStateController::new(
                DebugState {
                    enabled: false,
                    target_url: "https://api.example.com".into(),
                },
                None,
            ),
            LogStoreConfig::default(),
            None,
        );
        let (id, mut rx) = hub.viewers.register();
        rx.try_recv().unwrap();

        handle_viewer_text(&hub, id, "{not json").await;
        handle_viewer_text(&hub, id, r#"{"type":"reboot"}"#).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.viewers.viewer_count(), 1);

        handle_viewer_text(&hub, id, r#"{"type":"setDebug","enabled":true}"#).await;
        assert!(hub.control.is_enabled());
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::DebugUpdate { debug_mode: true }
        );
    }
}
