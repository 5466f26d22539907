// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Browser-facing signaling frames. The `id` field selects the message kind.

use serde::{Deserialize, Serialize};

/// One remote ICE candidate as the browser submits it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    #[serde(default)]
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

/// Frames a browser may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room: String,
        name: String,
    },
    ReceiveVideoFrom {
        sender: String,
        sdp_offer: String,
    },
    OnIceCandidate {
        /// The media-direction label the browser negotiated this candidate
        /// for: its own name for the outgoing peer, the sender's name for an
        /// incoming one. Absent in loopback mode.
        #[serde(default)]
        name: Option<String>,
        candidate: IceCandidateInit,
    },
    LeaveRoom,
    /// Loopback endpoint only.
    Start {
        sdp_offer: String,
    },
    /// Loopback endpoint only.
    Stop,
}

/// Frames the gateway sends to a browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    ExistingParticipants {
        data: Vec<String>,
    },
    NewParticipantArrived {
        name: String,
    },
    ParticipantLeft {
        name: String,
    },
    ReceiveVideoAnswer {
        name: String,
        sdp_answer: String,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// The candidate object exactly as KMS produced it.
        candidate: serde_json::Value,
    },
    StartResponse {
        sdp_answer: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// The reply for unparseable or out-of-place client frames.
    pub fn invalid() -> Self {
        Self::Error {
            message: "Invalid message".to_owned(),
        }
    }
}
