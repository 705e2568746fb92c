use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};

use crate::connection_manager::{Connection, DisconnectReason};
use crate::hub::Hub;
use crate::server::AppState;

use super::message::OutboundMessage;

/// How long the writer may keep flushing after the hub closed a connection
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip(ws, state))]
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.hub.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Drive an established WebSocket connection until either side ends it
#[tracing::instrument(name = "ws.connection", skip_all, fields(otel.kind = "server"))]
pub async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let connection_start = std::time::Instant::now();
    let (connection, mut rx) = hub.connect();
    let connection_id = connection.id;

    tracing::info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer: drain the outbound buffer onto the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg {
                OutboundMessage::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    return None;
                }
                other => match other.to_json() {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize envelope");
                        continue;
                    }
                },
            };

            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                return Some(DisconnectReason::TransportError);
            }
        }
        None
    });

    // Reader: feed inbound frames to the hub
    let reader_hub = hub.clone();
    let reader_conn = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &reader_hub, &reader_conn) {
                        return DisconnectReason::ClientClosed;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    return DisconnectReason::TransportError;
                }
            }
        }
        DisconnectReason::ClientClosed
    });

    let reason = tokio::select! {
        result = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            result.ok().flatten().unwrap_or(DisconnectReason::ClientClosed)
        }
        result = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            result.unwrap_or(DisconnectReason::TransportError)
        }
        _ = connection.closed() => {
            // Hub-initiated close; let the writer flush the close frame
            let _ = tokio::time::timeout(CLOSE_GRACE, &mut send_task).await;
            connection.close_reason().unwrap_or(DisconnectReason::Shutdown)
        }
    };

    send_task.abort();
    recv_task.abort();
    hub.disconnect(connection_id, reason);

    tracing::info!(
        connection_id = %connection_id,
        reason = %reason,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Process a received WebSocket message.
/// Returns false if the connection should be closed.
fn process_message(msg: Message, hub: &Hub, connection: &Arc<Connection>) -> bool {
    match msg {
        Message::Text(text) => {
            hub.handle_text(connection, text.as_str());
            true
        }
        Message::Binary(_) => {
            hub.reject_binary(connection);
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Protocol-level pings are answered by axum; they still prove liveness
            connection.record_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %connection.id, "Received close frame");
            false
        }
    }
}
