// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use kurento::TransportOptions;

/// Configuration for the roomgate signaling gateway.
#[derive(Debug, Clone, clap::Parser)]
pub struct GatewayConfig {
    /// KMS JSON-RPC WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:8888/kurento", env = "ROOMGATE_KMS_URL")]
    pub kms_url: String,

    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "ROOMGATE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "ROOMGATE_PORT")]
    pub port: u16,

    /// Capacity of the KMS event queue. A full queue backpressures the KMS
    /// socket rather than dropping events.
    #[arg(long, default_value_t = 64, env = "ROOMGATE_EVENT_QUEUE_SIZE")]
    pub event_queue_size: usize,

    /// KMS connect timeout in milliseconds.
    #[arg(long, default_value_t = 5000, env = "ROOMGATE_KMS_CONNECT_TIMEOUT_MS")]
    pub kms_connect_timeout_ms: u64,

    /// Per-RPC response deadline in milliseconds. 0 waits forever.
    #[arg(long, default_value_t = 30000, env = "ROOMGATE_KMS_RPC_TIMEOUT_MS")]
    pub kms_rpc_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_millis(self.kms_connect_timeout_ms),
            rpc_timeout: match self.kms_rpc_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            event_queue_size: self.event_queue_size,
        }
    }
}
