// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-participant media state: one outgoing endpoint plus one incoming
//! endpoint per remote sender being watched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kurento::media::events;
use kurento::{EventHandler, MediaElement, MediaPipeline};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::{IceCandidateInit, ServerMessage};
use crate::state::ClientHandle;

/// One browser participant inside a room.
pub struct UserSession {
    name: String,
    room_name: String,
    client: ClientHandle,
    pipeline: MediaPipeline,
    outgoing: MediaElement,
    incoming: RwLock<HashMap<String, MediaElement>>,
    closed: AtomicBool,
}

impl UserSession {
    /// Create the participant's outgoing endpoint on the room's shared
    /// pipeline and subscribe its ICE candidates, tagged with the
    /// participant's own name.
    pub async fn create(
        name: &str,
        room_name: &str,
        client: ClientHandle,
        pipeline: &MediaPipeline,
    ) -> kurento::Result<Arc<Self>> {
        let outgoing = pipeline.create_webrtc_endpoint().await?;
        outgoing
            .subscribe(
                events::ICE_CANDIDATE_FOUND,
                ice_forwarder(&outgoing, client.clone(), name),
            )
            .await?;
        Ok(Arc::new(Self {
            name: name.to_owned(),
            room_name: room_name.to_owned(),
            client,
            pipeline: pipeline.clone(),
            outgoing,
            incoming: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn outgoing(&self) -> &MediaElement {
        &self.outgoing
    }

    /// Answer `sdp_offer` on the endpoint receiving from `sender`, push the
    /// answer to this participant's browser, then start ICE gathering.
    pub async fn receive_video_from(
        &self,
        sender: &Arc<UserSession>,
        sdp_offer: &str,
    ) -> kurento::Result<()> {
        info!(
            name = %self.name,
            sender = %sender.name,
            room = %self.room_name,
            "connecting participants"
        );
        let endpoint = self.endpoint_for(sender).await?;
        let sdp_answer = endpoint.process_offer(sdp_offer).await?;
        self.client.send(ServerMessage::ReceiveVideoAnswer {
            name: sender.name.clone(),
            sdp_answer,
        });
        endpoint.gather_candidates().await?;
        Ok(())
    }

    /// The endpoint that receives `sender`'s media: the outgoing endpoint
    /// when the sender is this participant (loopback), otherwise the
    /// per-sender incoming endpoint, created and wired on first use.
    async fn endpoint_for(&self, sender: &Arc<UserSession>) -> kurento::Result<MediaElement> {
        if *self == **sender {
            debug!(name = %self.name, "configuring loopback");
            return Ok(self.outgoing.clone());
        }

        let created = {
            let mut incoming = self.incoming.write().await;
            if let Some(existing) = incoming.get(&sender.name) {
                return Ok(existing.clone());
            }
            debug!(name = %self.name, sender = %sender.name, "creating incoming endpoint");
            let endpoint = self.pipeline.create_webrtc_endpoint().await?;
            endpoint
                .subscribe(
                    events::ICE_CANDIDATE_FOUND,
                    ice_forwarder(&endpoint, self.client.clone(), &sender.name),
                )
                .await?;
            incoming.insert(sender.name.clone(), endpoint.clone());
            endpoint
        };

        // Wire the sender's media into the fresh endpoint. Existing
        // endpoints were connected when they were created.
        sender.outgoing().connect(&created).await?;
        Ok(created)
    }

    /// Route a remote candidate to the endpoint the browser negotiated it
    /// for. Candidates for a not-yet-provisioned endpoint are dropped.
    pub async fn add_candidate(
        &self,
        candidate: &IceCandidateInit,
        name: &str,
    ) -> anyhow::Result<()> {
        let value = serde_json::to_value(candidate)?;
        if name == self.name {
            self.outgoing.add_ice_candidate(&value).await?;
            return Ok(());
        }
        let endpoint = self.incoming.read().await.get(name).cloned();
        match endpoint {
            Some(endpoint) => endpoint.add_ice_candidate(&value).await?,
            None => {
                debug!(name = %self.name, sender = name, "dropping candidate for missing endpoint");
            }
        }
        Ok(())
    }

    /// Stop receiving from `sender_name` and release its endpoint.
    pub async fn cancel_video_from(&self, sender_name: &str) {
        let endpoint = self.incoming.write().await.remove(sender_name);
        if let Some(endpoint) = endpoint {
            debug!(name = %self.name, sender = sender_name, "releasing incoming endpoint");
            if let Err(e) = endpoint.release().await {
                warn!(
                    name = %self.name,
                    sender = sender_name,
                    err = %e,
                    "failed to release incoming endpoint"
                );
            }
        }
    }

    /// Release every endpoint this participant owns. Safe to call more than
    /// once; each endpoint is released at most once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(name = %self.name, "releasing participant resources");
        let drained: Vec<(String, MediaElement)> = self.incoming.write().await.drain().collect();
        for (sender, endpoint) in drained {
            if let Err(e) = endpoint.release().await {
                warn!(
                    name = %self.name,
                    sender = %sender,
                    err = %e,
                    "failed to release incoming endpoint"
                );
            }
        }
        if let Err(e) = self.outgoing.release().await {
            warn!(name = %self.name, err = %e, "failed to release outgoing endpoint");
        }
    }
}

impl PartialEq for UserSession {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.room_name == other.room_name
    }
}

/// Forward `IceCandidateFound` events from one endpoint to the browser,
/// tagged with the name the browser used for that media direction. The
/// dispatcher fans events out by type, so the handler keeps only those
/// whose source is its own endpoint.
fn ice_forwarder(endpoint: &MediaElement, client: ClientHandle, tag: &str) -> EventHandler {
    let source = endpoint.id().to_owned();
    let tag = tag.to_owned();
    Arc::new(move |value: &Value| {
        if value.pointer("/data/source").and_then(Value::as_str) != Some(source.as_str()) {
            return;
        }
        let Some(candidate) = value.pointer("/data/candidate") else {
            warn!(tag = %tag, "IceCandidateFound event without candidate");
            return;
        };
        client.send(ServerMessage::IceCandidate {
            name: Some(tag.clone()),
            candidate: candidate.clone(),
        });
    })
}
