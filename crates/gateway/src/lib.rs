// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! roomgate: signaling gateway between browser WebSockets and a Kurento
//! Media Server. Rooms share one pipeline; every participant's outgoing
//! endpoint is wired into per-viewer incoming endpoints on demand.

pub mod config;
pub mod protocol;
pub mod rooms;
pub mod state;
pub mod transport;

use std::sync::Arc;

use kurento::KurentoClient;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::state::GatewayState;
use crate::transport::build_router;

/// Run the gateway until shutdown.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let kurento = KurentoClient::connect(config.kms_url.as_str(), config.transport_options()).await?;
    tracing::info!(kms = %config.kms_url, "KMS connection ready");

    let state = Arc::new(GatewayState::new(config, kurento, shutdown.clone()));
    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("roomgate listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
