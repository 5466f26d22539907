// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Group-call signaling over a per-browser WebSocket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::rooms::UserSession;
use crate::state::{ClientHandle, GatewayState};

/// `GET /groupcall` — WebSocket upgrade for the room protocol.
pub async fn groupcall_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_groupcall(state, socket))
}

/// Per-connection loop. Inbound frames are handled strictly in arrival
/// order — SDP negotiation for one peer must not interleave — while
/// outbound frames queue on the client channel until the loop drains them.
async fn handle_groupcall(state: Arc<GatewayState>, socket: WebSocket) {
    let (client, mut outbound_rx) = state.new_client();
    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!(client = client.id(), "group-call connection open");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch(&state, &client, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            }
        }
    }

    // A dropped socket leaves like an explicit leaveRoom.
    debug!(client = client.id(), "group-call connection closed");
    if let Some(user) = state.registry.remove_by_session(client.id()).await {
        leave(&state, &user).await;
    }
}

/// Route one inbound frame.
async fn dispatch(state: &Arc<GatewayState>, client: &ClientHandle, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(client = client.id(), err = %e, "unparseable client frame");
            client.send(ServerMessage::invalid());
            return;
        }
    };

    match message {
        ClientMessage::JoinRoom { room, name } => join(state, client, &room, &name).await,

        ClientMessage::ReceiveVideoFrom { sender, sdp_offer } => {
            let Some(user) = state.registry.get_by_session(client.id()).await else {
                warn!(client = client.id(), "receiveVideoFrom before joinRoom");
                client.send(ServerMessage::invalid());
                return;
            };
            // The sender may have just left; nothing to answer then.
            let Some(sender) = state.registry.get_by_name(&sender).await else {
                info!(name = %user.name(), sender = %sender, "unknown sender, ignoring");
                return;
            };
            if let Err(e) = user.receive_video_from(&sender, &sdp_offer).await {
                warn!(
                    name = %user.name(),
                    sender = %sender.name(),
                    err = %e,
                    "video negotiation failed"
                );
            }
        }

        ClientMessage::OnIceCandidate { name, candidate } => {
            if candidate.candidate.is_empty() {
                return; // end-of-candidates marker
            }
            let Some(user) = state.registry.get_by_session(client.id()).await else {
                return;
            };
            let Some(name) = name else {
                debug!(name = %user.name(), "candidate without a direction tag, dropping");
                return;
            };
            if let Err(e) = user.add_candidate(&candidate, &name).await {
                warn!(name = %user.name(), err = %e, "failed to add candidate");
            }
        }

        ClientMessage::LeaveRoom => {
            if let Some(user) = state.registry.remove_by_session(client.id()).await {
                leave(state, &user).await;
            }
        }

        ClientMessage::Start { .. } | ClientMessage::Stop => {
            warn!(client = client.id(), "loopback frame on the group-call socket");
            client.send(ServerMessage::invalid());
        }
    }
}

async fn join(state: &Arc<GatewayState>, client: &ClientHandle, room_name: &str, name: &str) {
    if state.registry.get_by_session(client.id()).await.is_some() {
        warn!(client = client.id(), name, "second joinRoom on one connection");
        client.send(ServerMessage::Error {
            message: "already in a room".to_owned(),
        });
        return;
    }

    info!(name, room = room_name, "join requested");
    let room = match state.rooms.get_or_create(room_name).await {
        Ok(room) => room,
        Err(e) => {
            warn!(room = room_name, err = %e, "room creation failed");
            client.send(ServerMessage::Error {
                message: "could not create room".to_owned(),
            });
            return;
        }
    };
    match room.join(name, client.clone()).await {
        Ok(user) => state.registry.register(user).await,
        Err(e) => {
            warn!(name, room = room_name, err = %e, "join failed");
            client.send(ServerMessage::Error {
                message: "could not join room".to_owned(),
            });
        }
    }
}

/// Shared tail of `leaveRoom` and socket close: room broadcast, endpoint
/// release, empty-room teardown.
async fn leave(state: &Arc<GatewayState>, user: &Arc<UserSession>) {
    match state.rooms.get(user.room_name()).await {
        Some(room) => {
            room.leave(user).await;
            state.rooms.remove_if_empty(user.room_name()).await;
        }
        // Room already gone; still release this participant's endpoints.
        None => user.close().await,
    }
}
