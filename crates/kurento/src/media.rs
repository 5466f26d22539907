// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed handles over KMS media objects.
//!
//! A handle is an object id plus a kind tag; all state lives on KMS. The
//! kind tag gates which operations a handle accepts — there is no type
//! hierarchy, just a flat [`MediaElement`] and the root [`MediaPipeline`].
//! A handle is valid between its create-ack and release-ack.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{KurentoError, Result};
use crate::transport::{EventHandler, KurentoTransport};

/// Event types KMS publishes on media objects.
pub mod events {
    pub const ICE_CANDIDATE_FOUND: &str = "IceCandidateFound";
    pub const ICE_GATHERING_DONE: &str = "IceGatheringDone";
    pub const ICE_COMPONENT_STATE_CHANGE: &str = "IceComponentStateChange";
    pub const NEW_CANDIDATE_PAIR_SELECTED: &str = "NewCandidatePairSelected";
    pub const DATA_CHANNEL_OPEN: &str = "DataChannelOpen";
    pub const DATA_CHANNEL_CLOSE: &str = "DataChannelClose";
    pub const CONNECTION_STATE_CHANGED: &str = "ConnectionStateChanged";
    pub const MEDIA_STATE_CHANGED: &str = "MediaStateChanged";
    pub const END_OF_STREAM: &str = "EndOfStream";
    pub const CODE_FOUND: &str = "CodeFound";
}

/// The KMS object types this client can instantiate inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    WebRtcEndpoint,
    RtpEndpoint,
    PlayerEndpoint,
    RecorderEndpoint,
    HttpEndpoint,
    GStreamerFilter,
    FaceOverlayFilter,
    ZBarFilter,
    Composite,
    Dispatcher,
}

impl MediaKind {
    /// The remote type name used in the `create` RPC.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::WebRtcEndpoint => "WebRtcEndpoint",
            Self::RtpEndpoint => "RtpEndpoint",
            Self::PlayerEndpoint => "PlayerEndpoint",
            Self::RecorderEndpoint => "RecorderEndpoint",
            Self::HttpEndpoint => "HttpEndpoint",
            Self::GStreamerFilter => "GStreamerFilter",
            Self::FaceOverlayFilter => "FaceOverlayFilter",
            Self::ZBarFilter => "ZBarFilter",
            Self::Composite => "Composite",
            Self::Dispatcher => "Dispatcher",
        }
    }

    /// Kinds that negotiate SDP and gather ICE candidates.
    fn is_sdp(self) -> bool {
        matches!(self, Self::WebRtcEndpoint | Self::RtpEndpoint)
    }

    /// Kinds backed by a URI (players and recorders).
    fn is_uri(self) -> bool {
        matches!(self, Self::PlayerEndpoint | Self::RecorderEndpoint)
    }
}

/// The root media object. Every element lives inside exactly one pipeline
/// and shares its media clock.
#[derive(Clone)]
pub struct MediaPipeline {
    id: String,
    transport: Arc<KurentoTransport>,
}

impl MediaPipeline {
    pub(crate) async fn create(transport: Arc<KurentoTransport>) -> Result<Self> {
        let id = transport.create("MediaPipeline", Map::new()).await?;
        tracing::debug!(pipeline = %id, "created media pipeline");
        Ok(Self { id, transport })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Create an element of `kind` inside this pipeline. The pipeline id is
    /// attached to the constructor params; extra params pass through.
    pub async fn create_element(
        &self,
        kind: MediaKind,
        mut constructor_params: Map<String, Value>,
    ) -> Result<MediaElement> {
        constructor_params.insert("mediaPipeline".to_owned(), Value::String(self.id.clone()));
        let id = self
            .transport
            .create(kind.type_name(), constructor_params)
            .await?;
        tracing::debug!(element = %id, kind = kind.type_name(), pipeline = %self.id, "created element");
        Ok(MediaElement {
            id,
            kind,
            pipeline_id: self.id.clone(),
            transport: Arc::clone(&self.transport),
        })
    }

    pub async fn create_webrtc_endpoint(&self) -> Result<MediaElement> {
        self.create_element(MediaKind::WebRtcEndpoint, Map::new()).await
    }

    /// Release the pipeline. KMS releases contained elements with it.
    pub async fn release(&self) -> Result<()> {
        self.transport.release(&self.id).await
    }
}

/// A non-pipeline media object: endpoint, filter, or hub.
#[derive(Clone)]
pub struct MediaElement {
    id: String,
    kind: MediaKind,
    pipeline_id: String,
    transport: Arc<KurentoTransport>,
}

impl MediaElement {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Wire this element's output into `sink`. An element may be its own
    /// sink (loopback).
    pub async fn connect(&self, sink: &MediaElement) -> Result<()> {
        let mut params = Map::new();
        params.insert("sink".to_owned(), Value::String(sink.id.clone()));
        self.transport.invoke(&self.id, "connect", params).await.map(|_| ())
    }

    pub async fn disconnect(&self, sink: &MediaElement) -> Result<()> {
        let mut params = Map::new();
        params.insert("sink".to_owned(), Value::String(sink.id.clone()));
        self.transport
            .invoke(&self.id, "disconnect", params)
            .await
            .map(|_| ())
    }

    /// Ask KMS for an SDP offer.
    pub async fn generate_offer(&self) -> Result<String> {
        self.require(self.kind.is_sdp(), "generateOffer")?;
        let value = self.transport.invoke(&self.id, "generateOffer", Map::new()).await?;
        string_value(value, "generateOffer")
    }

    /// Process a remote SDP offer, returning the SDP answer.
    pub async fn process_offer(&self, offer: &str) -> Result<String> {
        self.require(self.kind.is_sdp(), "processOffer")?;
        let mut params = Map::new();
        params.insert("offer".to_owned(), Value::String(offer.to_owned()));
        let value = self.transport.invoke(&self.id, "processOffer", params).await?;
        string_value(value, "processOffer")
    }

    /// Process the remote SDP answer to a previously generated offer.
    pub async fn process_answer(&self, answer: &str) -> Result<()> {
        self.require(self.kind.is_sdp(), "processAnswer")?;
        let mut params = Map::new();
        params.insert("answer".to_owned(), Value::String(answer.to_owned()));
        self.transport
            .invoke(&self.id, "processAnswer", params)
            .await
            .map(|_| ())
    }

    /// Feed a remote ICE candidate into the endpoint.
    pub async fn add_ice_candidate(&self, candidate: &Value) -> Result<()> {
        self.require(self.kind.is_sdp(), "addIceCandidate")?;
        let mut params = Map::new();
        params.insert("candidate".to_owned(), candidate.clone());
        self.transport
            .invoke(&self.id, "addIceCandidate", params)
            .await
            .map(|_| ())
    }

    /// Start local ICE gathering. Candidates arrive as `IceCandidateFound`
    /// events after this returns.
    pub async fn gather_candidates(&self) -> Result<()> {
        self.require(self.kind.is_sdp(), "gatherCandidates")?;
        self.transport
            .invoke(&self.id, "gatherCandidates", Map::new())
            .await
            .map(|_| ())
    }

    pub async fn play(&self) -> Result<()> {
        self.require(self.kind == MediaKind::PlayerEndpoint, "play")?;
        self.transport.invoke(&self.id, "play", Map::new()).await.map(|_| ())
    }

    pub async fn record(&self) -> Result<()> {
        self.require(self.kind == MediaKind::RecorderEndpoint, "record")?;
        self.transport.invoke(&self.id, "record", Map::new()).await.map(|_| ())
    }

    pub async fn pause(&self) -> Result<()> {
        self.require(self.kind.is_uri(), "pause")?;
        self.transport.invoke(&self.id, "pause", Map::new()).await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<()> {
        self.require(self.kind.is_uri(), "stop")?;
        self.transport.invoke(&self.id, "stop", Map::new()).await.map(|_| ())
    }

    /// Overlay an image on detected faces. Offsets and sizes are fractions
    /// of the face bounding box.
    pub async fn set_overlayed_image(
        &self,
        uri: &str,
        offset_x: f64,
        offset_y: f64,
        width: f64,
        height: f64,
    ) -> Result<()> {
        self.require(self.kind == MediaKind::FaceOverlayFilter, "setOverlayedImage")?;
        let mut params = Map::new();
        params.insert("uri".to_owned(), Value::String(uri.to_owned()));
        params.insert("offsetXPercent".to_owned(), json_f64(offset_x));
        params.insert("offsetYPercent".to_owned(), json_f64(offset_y));
        params.insert("widthPercent".to_owned(), json_f64(width));
        params.insert("heightPercent".to_owned(), json_f64(height));
        self.transport
            .invoke(&self.id, "setOverlayedImage", params)
            .await
            .map(|_| ())
    }

    /// Subscribe `handler` to `event_type` on this element.
    pub async fn subscribe(&self, event_type: &str, handler: EventHandler) -> Result<String> {
        self.transport.subscribe(&self.id, event_type, handler).await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.transport.unsubscribe(&self.id, subscription_id).await
    }

    /// Release the element. The handle must not be used afterwards.
    pub async fn release(&self) -> Result<()> {
        self.transport.release(&self.id).await
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(KurentoError::Unsupported {
                kind: self.kind.type_name(),
                operation,
            })
        }
    }
}

/// Extract the string payload an operation is defined to return.
fn string_value(value: Option<Value>, operation: &str) -> Result<String> {
    match value.as_ref().and_then(Value::as_str) {
        Some(s) => Ok(s.to_owned()),
        None => Err(KurentoError::Protocol(format!(
            "{operation} returned no value"
        ))),
    }
}

/// A float RPC parameter; NaN and infinities have no JSON form and become null.
fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
#[path = "media_tests.rs"]
mod tests;
