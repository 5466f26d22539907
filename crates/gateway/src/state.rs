// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU64, Ordering};

use kurento::KurentoClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::protocol::ServerMessage;
use crate::rooms::{RoomManager, UserRegistry};

/// Identifies one browser WebSocket connection.
pub type ClientId = u64;

/// Shared gateway state.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub kurento: KurentoClient,
    pub rooms: RoomManager,
    pub registry: UserRegistry,
    pub shutdown: CancellationToken,
    next_client_id: AtomicU64,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, kurento: KurentoClient, shutdown: CancellationToken) -> Self {
        Self {
            rooms: RoomManager::new(kurento.clone()),
            registry: UserRegistry::default(),
            config,
            kurento,
            shutdown,
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Allocate the handle and outbound queue for a new browser connection.
    pub fn new_client(&self) -> (ClientHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ClientHandle::new(self.next_client_id.fetch_add(1, Ordering::Relaxed), tx);
        (handle, rx)
    }
}

/// Sender half of one browser connection. KMS event handlers hold clones;
/// the channel is unbounded so sends never block the event dispatcher.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    pub(crate) fn new(id: ClientId, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue a frame toward the browser. False means the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}
