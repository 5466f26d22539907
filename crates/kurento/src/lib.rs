// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Async client for Kurento Media Server: JSON-RPC 2.0 over one multiplexed
//! WebSocket, plus typed handles for the media object graph.

pub mod client;
pub mod error;
pub mod media;
pub mod test_support;
pub mod transport;

pub use client::KurentoClient;
pub use error::{KurentoError, Result};
pub use media::{MediaElement, MediaKind, MediaPipeline};
pub use transport::{EventHandler, KurentoTransport, TransportOptions};
