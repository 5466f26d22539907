// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Errors surfaced by the KMS transport and media layer.
#[derive(Debug)]
pub enum KurentoError {
    /// Connecting to KMS exceeded the connect deadline.
    ConnectTimeout { url: String },
    /// Connecting to KMS failed outright (refused, DNS, handshake).
    Connect { url: String, message: String },
    /// No response arrived within the per-RPC deadline.
    RpcTimeout { method: String },
    /// The KMS socket ended while the request was in flight.
    TransportClosed,
    /// KMS answered with a JSON-RPC error. The full response envelope is kept
    /// for diagnostics.
    Rpc {
        message: String,
        envelope: serde_json::Value,
    },
    /// A frame or response violated the expected JSON-RPC shape.
    Protocol(String),
    /// The operation is not defined for this media element kind.
    Unsupported {
        kind: &'static str,
        operation: &'static str,
    },
}

impl fmt::Display for KurentoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectTimeout { url } => write!(f, "timed out connecting to KMS at {url}"),
            Self::Connect { url, message } => {
                write!(f, "failed to connect to KMS at {url}: {message}")
            }
            Self::RpcTimeout { method } => write!(f, "KMS did not answer '{method}' in time"),
            Self::TransportClosed => write!(f, "KMS connection closed"),
            Self::Rpc { message, .. } => write!(f, "KMS error: {message}"),
            Self::Protocol(detail) => write!(f, "protocol violation: {detail}"),
            Self::Unsupported { kind, operation } => {
                write!(f, "{kind} does not support '{operation}'")
            }
        }
    }
}

impl std::error::Error for KurentoError {}

pub type Result<T> = std::result::Result<T, KurentoError>;
