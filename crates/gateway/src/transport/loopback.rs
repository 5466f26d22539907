// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loopback echo endpoint: one private pipeline per connection, with the
//! endpoint's output wired back into itself.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use kurento::media::events;
use kurento::{MediaElement, MediaPipeline};
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{ClientHandle, GatewayState};

struct LoopbackMedia {
    pipeline: MediaPipeline,
    endpoint: MediaElement,
}

/// `GET /loopback` — WebSocket upgrade for the echo protocol.
pub async fn loopback_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_loopback(state, socket))
}

async fn handle_loopback(state: Arc<GatewayState>, socket: WebSocket) {
    let (client, mut outbound_rx) = state.new_client();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut media: Option<LoopbackMedia> = None;
    debug!(client = client.id(), "loopback connection open");

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
                Some(Ok(Message::Text(text))) => {
                    handle_message(&state, &client, &mut media, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            }
        }
    }

    debug!(client = client.id(), "loopback connection closed");
    if let Some(media) = media.take() {
        release(media).await;
    }
}

async fn handle_message(
    state: &Arc<GatewayState>,
    client: &ClientHandle,
    media: &mut Option<LoopbackMedia>,
    text: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(client = client.id(), err = %e, "unparseable loopback frame");
            client.send(ServerMessage::invalid());
            return;
        }
    };

    match message {
        ClientMessage::Start { sdp_offer } => {
            if media.is_some() {
                warn!(client = client.id(), "loopback already started");
                client.send(ServerMessage::Error {
                    message: "session already started".to_owned(),
                });
                return;
            }
            match start(state, client, &sdp_offer).await {
                Ok(started) => *media = Some(started),
                Err(e) => {
                    warn!(client = client.id(), err = %e, "loopback start failed");
                    client.send(ServerMessage::Error {
                        message: "could not start loopback".to_owned(),
                    });
                }
            }
        }

        ClientMessage::OnIceCandidate { candidate, .. } => {
            if candidate.candidate.is_empty() {
                return;
            }
            let Some(media) = media.as_ref() else {
                debug!(client = client.id(), "candidate before start, dropping");
                return;
            };
            match serde_json::to_value(&candidate) {
                Ok(value) => {
                    if let Err(e) = media.endpoint.add_ice_candidate(&value).await {
                        warn!(client = client.id(), err = %e, "failed to add candidate");
                    }
                }
                Err(e) => warn!(client = client.id(), err = %e, "unserializable candidate"),
            }
        }

        ClientMessage::Stop => {
            if let Some(media) = media.take() {
                release(media).await;
            }
        }

        ClientMessage::JoinRoom { .. }
        | ClientMessage::ReceiveVideoFrom { .. }
        | ClientMessage::LeaveRoom => {
            warn!(client = client.id(), "room frame on the loopback socket");
            client.send(ServerMessage::invalid());
        }
    }
}

/// Build the echo graph and answer the offer.
async fn start(
    state: &Arc<GatewayState>,
    client: &ClientHandle,
    sdp_offer: &str,
) -> anyhow::Result<LoopbackMedia> {
    let pipeline = state.kurento.create_pipeline().await?;
    match build_echo(&pipeline, client, sdp_offer).await {
        Ok(endpoint) => Ok(LoopbackMedia { pipeline, endpoint }),
        Err(e) => {
            if let Err(re) = pipeline.release().await {
                warn!(err = %re, "failed to release pipeline after failed start");
            }
            Err(e.into())
        }
    }
}

async fn build_echo(
    pipeline: &MediaPipeline,
    client: &ClientHandle,
    sdp_offer: &str,
) -> kurento::Result<MediaElement> {
    let endpoint = pipeline.create_webrtc_endpoint().await?;

    let source = endpoint.id().to_owned();
    let to_browser = client.clone();
    endpoint
        .subscribe(
            events::ICE_CANDIDATE_FOUND,
            Arc::new(move |value: &Value| {
                if value.pointer("/data/source").and_then(Value::as_str) != Some(source.as_str()) {
                    return;
                }
                if let Some(candidate) = value.pointer("/data/candidate") {
                    to_browser.send(ServerMessage::IceCandidate {
                        name: None,
                        candidate: candidate.clone(),
                    });
                }
            }),
        )
        .await?;

    // The endpoint is its own sink: media comes straight back.
    endpoint.connect(&endpoint).await?;
    let sdp_answer = endpoint.process_offer(sdp_offer).await?;
    client.send(ServerMessage::StartResponse { sdp_answer });
    endpoint.gather_candidates().await?;
    Ok(endpoint)
}

async fn release(media: LoopbackMedia) {
    if let Err(e) = media.endpoint.release().await {
        warn!(err = %e, "failed to release loopback endpoint");
    }
    if let Err(e) = media.pipeline.release().await {
        warn!(err = %e, "failed to release loopback pipeline");
    }
}
