//! WebSocket handler for the per-session stream channel.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::api::AppState;
use crate::session::SessionManager;

use super::hub::RelayHub;
use super::types::RelayCommand;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// WebSocket upgrade handler.
///
/// GET /compiler/{session_id}/stream
///
/// Attaching does not require the session to exist yet; clients routinely
/// open the stream before the first execute.
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("Stream upgrade request for session {}", session_id);
    let hub = state.relay.clone();
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| handle_stream(socket, hub, sessions, session_id))
}

async fn handle_stream(
    socket: WebSocket,
    hub: Arc<RelayHub>,
    sessions: Arc<SessionManager>,
    session_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let (mut event_rx, conn_id) = hub.register(&session_id);

    // Outbound task: relay events plus periodic protocol pings.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize relay event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound loop: stdin data from the client.
    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<RelayCommand>(&text) {
                Ok(RelayCommand::Input { data }) => {
                    sessions.touch(&session_id).await;
                    if !hub.forward_input(&session_id, data).await {
                        debug!("Input for session {} had no live process", session_id);
                    }
                }
                Err(e) => {
                    warn!(
                        "Unparseable command on session {} stream: {}",
                        session_id, e
                    );
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame on session {} stream", session_id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Pong for Ping is handled by axum.
            }
            Ok(Message::Close(_)) => {
                info!("Client closed session {} stream", session_id);
                break;
            }
            Err(e) => {
                warn!("Stream error for session {}: {}", session_id, e);
                break;
            }
        }
    }

    send_task.abort();
    hub.unregister(&session_id, conn_id);
    info!("Stream connection closed for session {}", session_id);
}
