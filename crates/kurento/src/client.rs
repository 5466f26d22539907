// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::error::Result;
use crate::media::MediaPipeline;
use crate::transport::{KurentoTransport, TransportOptions};

/// Entry point for talking to one KMS instance.
///
/// Wraps the shared [`KurentoTransport`]; cheap to clone and designed to be
/// injected into whatever owns the rooms — there are no globals here.
#[derive(Clone)]
pub struct KurentoClient {
    transport: Arc<KurentoTransport>,
}

impl KurentoClient {
    /// Connect to KMS eagerly, failing fast when it is unreachable.
    pub async fn connect(url: impl Into<String>, opts: TransportOptions) -> Result<Self> {
        let transport = KurentoTransport::connect(url, opts).await?;
        Ok(Self { transport })
    }

    /// Wrap an existing transport.
    pub fn new(transport: Arc<KurentoTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<KurentoTransport> {
        &self.transport
    }

    /// Create a fresh media pipeline.
    pub async fn create_pipeline(&self) -> Result<MediaPipeline> {
        MediaPipeline::create(Arc::clone(&self.transport)).await
    }
}
