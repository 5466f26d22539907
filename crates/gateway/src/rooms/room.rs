// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A named conference: one shared pipeline and its membership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kurento::MediaPipeline;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::ServerMessage;
use crate::rooms::UserSession;
use crate::state::ClientHandle;

pub struct Room {
    name: String,
    pipeline: MediaPipeline,
    participants: RwLock<HashMap<String, Arc<UserSession>>>,
    closed: AtomicBool,
}

impl Room {
    pub(crate) fn new(name: &str, pipeline: MediaPipeline) -> Self {
        Self {
            name: name.to_owned(),
            pipeline,
            participants: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a participant. Existing members learn of the arrival before the
    /// newcomer is inserted, so it never sees its own arrival; the newcomer
    /// gets the membership snapshot (excluding itself) before this returns,
    /// so it can start negotiating immediately.
    pub async fn join(
        &self,
        user_name: &str,
        client: ClientHandle,
    ) -> anyhow::Result<Arc<UserSession>> {
        info!(room = %self.name, name = user_name, "adding participant");
        let mut participants = self.participants.write().await;
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("room '{}' is closed", self.name);
        }
        if participants.contains_key(user_name) {
            anyhow::bail!("name '{user_name}' is taken in room '{}'", self.name);
        }

        let participant =
            UserSession::create(user_name, &self.name, client, &self.pipeline).await?;

        for existing in participants.values() {
            let delivered = existing.client().send(ServerMessage::NewParticipantArrived {
                name: user_name.to_owned(),
            });
            if !delivered {
                debug!(
                    room = %self.name,
                    name = %existing.name(),
                    "participant unreachable during arrival broadcast"
                );
            }
        }

        let others: Vec<String> = participants.keys().cloned().collect();
        participants.insert(user_name.to_owned(), Arc::clone(&participant));
        drop(participants);

        debug!(room = %self.name, name = user_name, peers = others.len(), "sending membership snapshot");
        participant
            .client()
            .send(ServerMessage::ExistingParticipants { data: others });
        Ok(participant)
    }

    /// Remove a participant: notify the others, drop their endpoints toward
    /// the leaver, then release the leaver's own media. Trouble reaching one
    /// sibling never stops the rest.
    pub async fn leave(&self, user: &Arc<UserSession>) {
        info!(room = %self.name, name = %user.name(), "participant leaving");
        let remaining: Vec<Arc<UserSession>> = {
            let mut participants = self.participants.write().await;
            participants.remove(user.name());
            participants.values().cloned().collect()
        };

        for peer in &remaining {
            let delivered = peer.client().send(ServerMessage::ParticipantLeft {
                name: user.name().to_owned(),
            });
            if !delivered {
                debug!(
                    room = %self.name,
                    name = %peer.name(),
                    "participant unreachable during leave broadcast"
                );
            }
        }
        for peer in &remaining {
            peer.cancel_video_from(user.name()).await;
        }
        user.close().await;
    }

    /// Close every participant, clear membership, release the pipeline.
    pub async fn close(&self) {
        let drained: Vec<Arc<UserSession>> = {
            let mut participants = self.participants.write().await;
            self.closed.store(true, Ordering::SeqCst);
            participants.drain().map(|(_, p)| p).collect()
        };
        for participant in drained {
            participant.close().await;
        }
        if let Err(e) = self.pipeline.release().await {
            warn!(room = %self.name, err = %e, "failed to release pipeline");
        }
        debug!(room = %self.name, "room closed");
    }

    /// Mark the room closed if nobody is left, atomically with respect to
    /// joins. Returns whether it closed.
    pub(crate) async fn close_if_empty(&self) -> bool {
        let participants = self.participants.write().await;
        if !participants.is_empty() {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        true
    }

    pub async fn participants(&self) -> Vec<Arc<UserSession>> {
        self.participants.read().await.values().cloned().collect()
    }

    pub async fn participant(&self, name: &str) -> Option<Arc<UserSession>> {
        self.participants.read().await.get(name).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }
}
