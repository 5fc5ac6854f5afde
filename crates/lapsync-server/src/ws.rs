//! WebSocket connection session
//!
//! Clients connect to /api/v1/ws. Each connection subscribes to the hub,
//! receives a full snapshot, then gets every ledger event live while its
//! own submissions and reset requests are forwarded to the controller.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use lapsync_core::hub::Delivery;
use lapsync_core::protocol::{ClientMessage, ReceiptStatus, ServerMessage};
use lapsync_core::{ControllerHandle, ResetKind};
use tokio::sync::mpsc;

/// Frames queued by the receive side for the send side
#[derive(Debug)]
enum Outbound {
    Message(ServerMessage),
    /// Read the latest view at send time
    Snapshot,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode server message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}

fn snapshot_message(controller: &ControllerHandle) -> ServerMessage {
    ServerMessage::from(controller.snapshot().as_ref())
}

/// Handle an individual WebSocket connection
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Subscribe before reading the snapshot; anything committed in between
    // arrives twice and the client dedupes it by sequence number
    let mut subscription = state.controller.subscribe();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(32);
    tracing::debug!(
        subscribers = state.controller.subscriber_count(),
        "WebSocket client connected"
    );

    let controller = state.controller.clone();
    let mut send_task = tokio::spawn(async move {
        if send_message(&mut ws_sender, &snapshot_message(&controller))
            .await
            .is_err()
        {
            return;
        }

        loop {
            let message = tokio::select! {
                delivery = subscription.next() => match delivery {
                    Delivery::Event(event) => ServerMessage::from(event.as_ref()),
                    Delivery::Lagged(missed) => {
                        tracing::warn!(missed, "Client fell behind, resending snapshot");
                        snapshot_message(&controller)
                    }
                    Delivery::Closed => break,
                },
                outbound = out_rx.recv() => match outbound {
                    Some(Outbound::Message(message)) => message,
                    Some(Outbound::Snapshot) => snapshot_message(&controller),
                    None => break,
                },
            };
            if send_message(&mut ws_sender, &message).await.is_err() {
                break;
            }
        }
    });

    let controller = state.controller.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(command) => handle_client_message(&controller, command).await,
                        Err(e) => {
                            tracing::debug!("Malformed client message: {}", e);
                            Some(Outbound::Message(ServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            }))
                        }
                    };
                    if let Some(reply) = reply {
                        if out_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::debug!("WebSocket client disconnected");
}

async fn handle_client_message(
    controller: &ControllerHandle,
    command: ClientMessage,
) -> Option<Outbound> {
    match command {
        ClientMessage::SubmitRecord {
            client_record_id,
            elapsed_ms,
            captured_at,
            session_id,
        } => {
            let status = match controller
                .submit(
                    elapsed_ms,
                    client_record_id.clone(),
                    session_id,
                    Some(captured_at),
                )
                .await
            {
                Ok(outcome) => ReceiptStatus::from(&outcome),
                Err(e) => {
                    tracing::warn!(%client_record_id, "Submission failed: {}", e);
                    ReceiptStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
            Some(Outbound::Message(ServerMessage::Receipt {
                client_record_id,
                status,
            }))
        }
        ClientMessage::RequestSnapshot => Some(Outbound::Snapshot),
        ClientMessage::RequestReset => match controller.reset(ResetKind::Explicit).await {
            // Clients learn the outcome from the broadcast events
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Reset requested over WebSocket failed: {}", e);
                Some(Outbound::Message(ServerMessage::Error {
                    message: format!("Reset failed: {}", e),
                }))
            }
        },
    }
}
