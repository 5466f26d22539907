// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end signaling tests: real WebSocket connections against an
//! in-process gateway backed by the fake KMS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use kurento::test_support::FakeKms;
use kurento::KurentoClient;
use roomgate::config::GatewayConfig;
use roomgate::state::GatewayState;
use roomgate::transport::build_router;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Boot a gateway on an ephemeral port, wired to the given fake KMS.
async fn spawn_gateway(kms: &FakeKms) -> anyhow::Result<(SocketAddr, Arc<GatewayState>)> {
    let config = GatewayConfig {
        kms_url: kms.url(),
        host: "127.0.0.1".to_owned(),
        port: 0,
        event_queue_size: 64,
        kms_connect_timeout_ms: 1000,
        kms_rpc_timeout_ms: 5000,
    };
    let kurento = KurentoClient::connect(config.kms_url.as_str(), config.transport_options()).await?;
    let state = Arc::new(GatewayState::new(config, kurento, CancellationToken::new()));
    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, state))
}

/// One simulated browser connection.
struct Browser {
    tx: futures_util::stream::SplitSink<WsStream, WsMessage>,
    rx: futures_util::stream::SplitStream<WsStream>,
}

impl Browser {
    async fn connect(addr: SocketAddr, path: &str) -> anyhow::Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}")).await?;
        let (tx, rx) = stream.split();
        Ok(Self { tx, rx })
    }

    async fn send(&mut self, value: &Value) -> anyhow::Result<()> {
        self.send_raw(&value.to_string()).await
    }

    async fn send_raw(&mut self, text: &str) -> anyhow::Result<()> {
        self.tx
            .send(WsMessage::Text(text.to_owned().into()))
            .await
            .map_err(|e| anyhow::anyhow!("ws send: {e}"))
    }

    async fn recv(&mut self) -> anyhow::Result<Value> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
                .await
                .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
                .ok_or_else(|| anyhow::anyhow!("ws stream closed"))?
                .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
            match msg {
                WsMessage::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => anyhow::bail!("expected Text frame, got {other:?}"),
            }
        }
    }

    /// Assert nothing arrives for `ms` milliseconds.
    async fn expect_silence(&mut self, ms: u64) -> anyhow::Result<()> {
        match tokio::time::timeout(Duration::from_millis(ms), self.rx.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_)))) => Ok(()),
            Ok(other) => anyhow::bail!("expected silence, got {other:?}"),
        }
    }
}

/// Poll until `check` passes or two seconds elapse.
async fn eventually(check: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn join(browser: &mut Browser, room: &str, name: &str) -> anyhow::Result<Value> {
    browser.send(&json!({"id": "joinRoom", "room": room, "name": name})).await?;
    browser.recv().await
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_join_leave_broadcasts_membership() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    let snapshot = join(&mut a, "r", "A").await?;
    assert_eq!(snapshot, json!({"id": "existingParticipants", "data": []}));

    let mut b = Browser::connect(addr, "/groupcall").await?;
    let snapshot = join(&mut b, "r", "B").await?;
    assert_eq!(snapshot, json!({"id": "existingParticipants", "data": ["A"]}));

    let arrival = a.recv().await?;
    assert_eq!(arrival, json!({"id": "newParticipantArrived", "name": "B"}));

    let room = state.rooms.get("r").await.ok_or_else(|| anyhow::anyhow!("room missing"))?;
    assert!(!room.is_empty().await);
    assert!(room.participant("A").await.is_some());
    let mut names: Vec<String> =
        room.participants().await.iter().map(|p| p.name().to_owned()).collect();
    names.sort();
    assert_eq!(names, ["A", "B"]);
    assert!(state.registry.exists("A").await);

    // A disconnecting behaves exactly like leaveRoom.
    drop(a);
    let left = b.recv().await?;
    assert_eq!(left, json!({"id": "participantLeft", "name": "A"}));
    Ok(())
}

#[tokio::test]
async fn mesh_build_wires_sender_into_one_new_endpoint() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;
    let mut b = Browser::connect(addr, "/groupcall").await?;
    join(&mut b, "r", "B").await?;
    a.recv().await?; // newParticipantArrived B

    b.send(&json!({"id": "receiveVideoFrom", "sender": "A", "sdpOffer": "o"})).await?;
    let answer = b.recv().await?;
    assert_eq!(answer, json!({"id": "receiveVideoAnswer", "name": "A", "sdpAnswer": "answer:o"}));

    // obj-1 pipeline, obj-2 A-out, obj-3 B-out, obj-4 B's incoming from A.
    let endpoints = kms.created_of("WebRtcEndpoint");
    assert_eq!(endpoints.len(), 3, "exactly one new endpoint for the mesh edge");
    let incoming = endpoints[2].clone();

    let connects = kms.invocations_of("connect");
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0]["params"]["object"], endpoints[0], "A's outgoing endpoint is the source");
    assert_eq!(connects[0]["params"]["operationParams"]["sink"], incoming);

    let gathers = kms.invocations_of("gatherCandidates");
    assert_eq!(gathers.len(), 1);
    assert_eq!(gathers[0]["params"]["object"], incoming);

    // Re-negotiating against the same sender reuses the endpoint.
    b.send(&json!({"id": "receiveVideoFrom", "sender": "A", "sdpOffer": "o2"})).await?;
    let answer = b.recv().await?;
    assert_eq!(answer["sdpAnswer"], "answer:o2");
    assert_eq!(kms.created_of("WebRtcEndpoint").len(), 3);
    assert_eq!(kms.invocations_of("connect").len(), 1);
    Ok(())
}

#[tokio::test]
async fn ice_candidates_loop_both_directions() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;
    let mut b = Browser::connect(addr, "/groupcall").await?;
    join(&mut b, "r", "B").await?;
    a.recv().await?;

    b.send(&json!({"id": "receiveVideoFrom", "sender": "A", "sdpOffer": "o"})).await?;
    b.recv().await?;
    let incoming = kms.created_of("WebRtcEndpoint")[2].clone();

    // KMS found a candidate on B's incoming-from-A endpoint: only B hears
    // about it, labelled with the sender's name.
    kms.send_event(FakeKms::ice_candidate_event(&incoming, "cand-from-kms"))?;
    let candidate = b.recv().await?;
    assert_eq!(candidate["id"], "iceCandidate");
    assert_eq!(candidate["name"], "A");
    assert_eq!(candidate["candidate"]["candidate"], "cand-from-kms");
    a.expect_silence(200).await?;

    // B answers with its own candidate for the A direction.
    b.send(&json!({
        "id": "onIceCandidate",
        "name": "A",
        "candidate": {"candidate": "c2", "sdpMid": "0", "sdpMLineIndex": 0},
    }))
    .await?;
    eventually(|| !kms.invocations_of("addIceCandidate").is_empty()).await?;
    let added = kms.invocations_of("addIceCandidate");
    assert_eq!(added[0]["params"]["object"], incoming);
    assert_eq!(added[0]["params"]["operationParams"]["candidate"]["candidate"], "c2");
    Ok(())
}

#[tokio::test]
async fn own_candidates_go_to_the_outgoing_endpoint() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;
    let outgoing = kms.created_of("WebRtcEndpoint")[0].clone();

    a.send(&json!({
        "id": "onIceCandidate",
        "name": "A",
        "candidate": {"candidate": "c-self", "sdpMid": "0", "sdpMLineIndex": 0},
    }))
    .await?;
    eventually(|| !kms.invocations_of("addIceCandidate").is_empty()).await?;
    let added = kms.invocations_of("addIceCandidate");
    assert_eq!(added[0]["params"]["object"], outgoing);
    Ok(())
}

#[tokio::test]
async fn early_and_empty_candidates_are_dropped() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;
    let baseline = kms.requests().len();

    // No incoming endpoint for "C" exists yet.
    a.send(&json!({
        "id": "onIceCandidate",
        "name": "C",
        "candidate": {"candidate": "early", "sdpMid": "0", "sdpMLineIndex": 0},
    }))
    .await?;
    // End-of-candidates marker.
    a.send(&json!({"id": "onIceCandidate", "name": "A", "candidate": {"candidate": ""}})).await?;

    a.expect_silence(200).await?;
    assert_eq!(kms.requests().len(), baseline, "no RPC for dropped candidates");
    Ok(())
}

#[tokio::test]
async fn loopback_echoes_and_releases() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut c = Browser::connect(addr, "/loopback").await?;
    c.send(&json!({"id": "start", "sdpOffer": "o"})).await?;
    let response = c.recv().await?;
    assert_eq!(response, json!({"id": "startResponse", "sdpAnswer": "answer:o"}));

    let pipelines = kms.created_of("MediaPipeline");
    let endpoints = kms.created_of("WebRtcEndpoint");
    assert_eq!(pipelines.len(), 1);
    assert_eq!(endpoints.len(), 1);
    let endpoint = endpoints[0].clone();

    let connects = kms.invocations_of("connect");
    assert_eq!(connects[0]["params"]["object"], endpoint);
    assert_eq!(connects[0]["params"]["operationParams"]["sink"], endpoint, "endpoint is its own sink");
    assert_eq!(kms.invocations_of("gatherCandidates").len(), 1);

    // Candidates relay both ways; loopback frames carry no name.
    kms.send_event(FakeKms::ice_candidate_event(&endpoint, "loop-cand"))?;
    let candidate = c.recv().await?;
    assert_eq!(candidate["id"], "iceCandidate");
    assert!(candidate.get("name").is_none());
    assert_eq!(candidate["candidate"]["candidate"], "loop-cand");

    c.send(&json!({
        "id": "onIceCandidate",
        "candidate": {"candidate": "c3", "sdpMid": "0", "sdpMLineIndex": 0},
    }))
    .await?;
    eventually(|| !kms.invocations_of("addIceCandidate").is_empty()).await?;

    c.send(&json!({"id": "stop"})).await?;
    eventually(|| kms.requests_for("release").len() == 2).await?;
    let releases = kms.requests_for("release");
    assert_eq!(releases[0]["params"]["object"], endpoint);
    assert_eq!(releases[1]["params"]["object"], pipelines[0]);
    Ok(())
}

#[tokio::test]
async fn malformed_input_is_answered_without_touching_kms() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;

    a.send(&json!({"id": "bogus"})).await?;
    let reply = a.recv().await?;
    assert_eq!(reply, json!({"id": "error", "message": "Invalid message"}));

    a.send_raw("{not json").await?;
    let reply = a.recv().await?;
    assert_eq!(reply["id"], "error");

    assert!(kms.requests().is_empty(), "no KMS RPC for garbage input");

    // The connection keeps working.
    let snapshot = join(&mut a, "r", "A").await?;
    assert_eq!(snapshot["id"], "existingParticipants");
    Ok(())
}

#[tokio::test]
async fn last_leave_releases_endpoints_and_pipeline() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;
    let pipeline = kms.created_of("MediaPipeline")[0].clone();
    let outgoing = kms.created_of("WebRtcEndpoint")[0].clone();

    a.send(&json!({"id": "leaveRoom"})).await?;
    eventually(|| kms.requests_for("release").len() == 2).await?;
    let releases = kms.requests_for("release");
    assert_eq!(releases[0]["params"]["object"], outgoing);
    assert_eq!(releases[1]["params"]["object"], pipeline);

    assert_eq!(state.rooms.count().await, 0, "empty room torn down");
    assert_eq!(state.registry.count().await, 0);

    // Re-joining the same name builds a fresh room and pipeline.
    let snapshot = join(&mut a, "r", "A").await?;
    assert_eq!(snapshot, json!({"id": "existingParticipants", "data": []}));
    assert_eq!(kms.created_of("MediaPipeline").len(), 2);
    Ok(())
}

#[tokio::test]
async fn leaver_endpoints_are_cancelled_by_the_others() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;
    let mut b = Browser::connect(addr, "/groupcall").await?;
    join(&mut b, "r", "B").await?;
    a.recv().await?;

    // B watches A, then A leaves: B must drop its incoming-from-A endpoint.
    b.send(&json!({"id": "receiveVideoFrom", "sender": "A", "sdpOffer": "o"})).await?;
    b.recv().await?;
    let incoming = kms.created_of("WebRtcEndpoint")[2].clone();

    drop(a);
    let left = b.recv().await?;
    assert_eq!(left["id"], "participantLeft");
    eventually(|| {
        kms.requests_for("release")
            .iter()
            .any(|r| r["params"]["object"] == incoming)
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn explicit_room_removal_releases_everything() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;
    let pipeline = kms.created_of("MediaPipeline")[0].clone();

    assert!(state.rooms.remove("r").await);
    assert_eq!(state.rooms.count().await, 0);
    eventually(|| {
        kms.requests_for("release")
            .iter()
            .any(|r| r["params"]["object"] == pipeline)
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_names_are_rejected() -> anyhow::Result<()> {
    let kms = FakeKms::spawn().await?;
    let (addr, _state) = spawn_gateway(&kms).await?;

    let mut a = Browser::connect(addr, "/groupcall").await?;
    join(&mut a, "r", "A").await?;

    let mut imposter = Browser::connect(addr, "/groupcall").await?;
    let reply = join(&mut imposter, "r", "A").await?;
    assert_eq!(reply["id"], "error");
    Ok(())
}
