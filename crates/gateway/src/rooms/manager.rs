// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lazy room creation and teardown.

use std::collections::HashMap;
use std::sync::Arc;

use kurento::KurentoClient;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::rooms::Room;

pub struct RoomManager {
    kurento: KurentoClient,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl RoomManager {
    pub fn new(kurento: KurentoClient) -> Self {
        Self {
            kurento,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// The existing room, or a fresh one with its own pipeline. Creation is
    /// serialized: concurrent callers for one name see the same instance.
    pub async fn get_or_create(&self, name: &str) -> kurento::Result<Arc<Room>> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(name) {
            debug!(room = name, "room found");
            return Ok(Arc::clone(room));
        }
        debug!(room = name, "room not found, creating");
        let pipeline = self.kurento.create_pipeline().await?;
        let room = Arc::new(Room::new(name, pipeline));
        rooms.insert(name.to_owned(), Arc::clone(&room));
        info!(room = name, "room created");
        Ok(room)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(name).cloned()
    }

    /// Detach a room and close it, regardless of occupancy.
    pub async fn remove(&self, name: &str) -> bool {
        let room = self.rooms.lock().await.remove(name);
        match room {
            Some(room) => {
                room.close().await;
                info!(room = name, "room removed");
                true
            }
            None => false,
        }
    }

    /// Tear the room down once its last participant has left. A join racing
    /// this call either lands before the emptiness check or finds the room
    /// closed.
    pub async fn remove_if_empty(&self, name: &str) {
        let emptied = {
            let mut rooms = self.rooms.lock().await;
            let Some(room) = rooms.get(name).cloned() else {
                return;
            };
            if room.close_if_empty().await {
                rooms.remove(name)
            } else {
                None
            }
        };
        if let Some(room) = emptied {
            room.close().await;
            info!(room = name, "empty room removed");
        }
    }

    pub async fn count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
