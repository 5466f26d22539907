// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lookup of live participants by name and by browser connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::rooms::UserSession;
use crate::state::ClientId;

/// Both views are mutated together under one lock: a participant found by
/// either key is the same participant, or absent from both.
#[derive(Default)]
pub struct UserRegistry {
    inner: Mutex<Maps>,
}

#[derive(Default)]
struct Maps {
    by_name: HashMap<String, Arc<UserSession>>,
    by_client: HashMap<ClientId, Arc<UserSession>>,
}

impl UserRegistry {
    pub async fn register(&self, user: Arc<UserSession>) {
        let mut maps = self.inner.lock().await;
        maps.by_name.insert(user.name().to_owned(), Arc::clone(&user));
        maps.by_client.insert(user.client().id(), user);
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<UserSession>> {
        self.inner.lock().await.by_name.get(name).cloned()
    }

    pub async fn get_by_session(&self, client: ClientId) -> Option<Arc<UserSession>> {
        self.inner.lock().await.by_client.get(&client).cloned()
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.inner.lock().await.by_name.contains_key(name)
    }

    /// Drop both views for the participant on this connection. The name
    /// entry is only removed when it still points at this connection, so a
    /// later registration under the same name survives.
    pub async fn remove_by_session(&self, client: ClientId) -> Option<Arc<UserSession>> {
        let mut maps = self.inner.lock().await;
        let user = maps.by_client.remove(&client)?;
        let name_matches = maps
            .by_name
            .get(user.name())
            .is_some_and(|u| u.client().id() == client);
        if name_matches {
            maps.by_name.remove(user.name());
        }
        Some(user)
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.by_client.len()
    }
}
