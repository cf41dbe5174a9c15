//! Single request round trips and their failure modes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use calimero_reqresp::config::ReqRespConfig;
use calimero_reqresp::primitives::protocol::{
    GoodbyeReason, GoodbyeRequest, StateDeltaRequest, StateDeltaResponse, SubProtocol, WireMessage,
};
use calimero_reqresp::primitives::scoring::PeerErrorSeverity;
use calimero_reqresp::primitives::status::ReqRespStatus;
use calimero_reqresp::registry::SubProtocolRegistry;
use calimero_reqresp::ReqResp;
use common::{start_node, DeltaHandler, GoodbyeHandler, RecordingScoring, Script, TestNet, TestTransport};
use libp2p::PeerId;

fn fast_config() -> ReqRespConfig {
    ReqRespConfig {
        individual_request_timeout: Duration::from_millis(200),
        dial_timeout: Duration::from_millis(100),
        ..ReqRespConfig::default()
    }
}

#[tokio::test]
async fn request_round_trips_between_two_nodes() {
    let net = TestNet::default();

    let handler = DeltaHandler::default();
    let responder = start_node(
        &net,
        fast_config(),
        vec![],
        SubProtocolRegistry::default().with_handler(SubProtocol::StateDelta, Arc::new(handler.clone())),
    );
    let requester = start_node(
        &net,
        fast_config(),
        vec![responder.peer_id],
        SubProtocolRegistry::default(),
    );

    let request = StateDeltaRequest {
        context_id: [3; 32],
        height: 7,
    };
    let response = requester
        .engine
        .send_request_to_peer(responder.peer_id, SubProtocol::StateDelta, request.to_bytes())
        .await
        .expect("engine is started");

    assert_eq!(response.status, ReqRespStatus::Success, "request should succeed");

    let decoded = StateDeltaResponse::from_bytes(&response.data).expect("payload should decode");
    assert_eq!(
        decoded.delta,
        7_u64.to_le_bytes().to_vec(),
        "handler output should survive the wire"
    );
    assert_eq!(handler.served(), vec![7], "the responder should see the request");
    assert!(
        requester.scoring.penalties().is_empty(),
        "a successful exchange penalizes nobody"
    );
}

#[tokio::test]
async fn unscoped_request_samples_a_connected_peer() {
    let net = TestNet::default();

    let handler = DeltaHandler::default();
    let responder = start_node(
        &net,
        fast_config(),
        vec![],
        SubProtocolRegistry::default().with_handler(SubProtocol::StateDelta, Arc::new(handler.clone())),
    );
    let requester = start_node(
        &net,
        fast_config(),
        vec![responder.peer_id],
        SubProtocolRegistry::default(),
    );

    let request = StateDeltaRequest {
        context_id: [8; 32],
        height: 21,
    };
    let response = requester
        .engine
        .send_request(SubProtocol::StateDelta, request.to_bytes())
        .await
        .expect("engine is started");

    assert_eq!(response.status, ReqRespStatus::Success, "the sampled peer answers");
    assert_eq!(handler.served(), vec![21], "the only connected peer was chosen");
}

#[tokio::test]
async fn no_connected_peers_degrades_to_failure() {
    let net = TestNet::default();
    let requester = start_node(&net, fast_config(), vec![], SubProtocolRegistry::default());

    let response = requester
        .engine
        .send_request(SubProtocol::Ping, Bytes::from_static(b"anyone there"))
        .await
        .expect("engine is started");

    assert_eq!(
        response.status,
        ReqRespStatus::Failure,
        "an empty peer pool is a failure response, not an error"
    );
}

#[tokio::test]
async fn refused_dial_degrades_to_failure_and_penalizes() {
    let net = TestNet::default();
    let refusing = net.script_peer(Script::RefuseDial);
    let requester = start_node(&net, fast_config(), vec![refusing], SubProtocolRegistry::default());

    let request = StateDeltaRequest {
        context_id: [0; 32],
        height: 1,
    };
    let response = requester
        .engine
        .send_request_to_peer(refusing, SubProtocol::StateDelta, request.to_bytes())
        .await
        .expect("engine is started");

    assert_eq!(response.status, ReqRespStatus::Failure, "the call never raises");
    assert_eq!(
        requester.scoring.penalties(),
        vec![(refusing, PeerErrorSeverity::HighToleranceError)],
        "a refused dial is attributed to the peer"
    );
}

#[tokio::test(start_paused = true)]
async fn silent_peer_trips_the_individual_timeout() {
    let net = TestNet::default();
    let silent = net.script_peer(Script::Silent);
    let requester = start_node(&net, fast_config(), vec![silent], SubProtocolRegistry::default());

    let request = StateDeltaRequest {
        context_id: [0; 32],
        height: 1,
    };
    let response = requester
        .engine
        .send_request_to_peer(silent, SubProtocol::StateDelta, request.to_bytes())
        .await
        .expect("engine is started");

    assert_eq!(response.status, ReqRespStatus::Failure, "the timeout degrades to failure");
    assert_eq!(
        requester.scoring.penalties(),
        vec![(silent, PeerErrorSeverity::HighToleranceError)],
        "an unanswered request counts against the peer"
    );
}

#[tokio::test]
async fn goodbye_expects_no_reply_and_no_penalty() {
    let net = TestNet::default();

    let handler = GoodbyeHandler::default();
    let responder = start_node(
        &net,
        fast_config(),
        vec![],
        SubProtocolRegistry::default().with_handler(SubProtocol::Goodbye, Arc::new(handler.clone())),
    );
    let requester = start_node(
        &net,
        fast_config(),
        vec![responder.peer_id],
        SubProtocolRegistry::default(),
    );

    let request = GoodbyeRequest {
        reason: GoodbyeReason::Shutdown,
    };
    let response = requester
        .engine
        .send_request_to_peer(responder.peer_id, SubProtocol::Goodbye, request.to_bytes())
        .await
        .expect("engine is started");

    assert_ne!(response.status, ReqRespStatus::Success, "nothing comes back on a goodbye");
    assert_eq!(handler.received(), vec![request], "the goodbye still reaches the handler");
    assert!(
        requester.scoring.penalties().is_empty(),
        "a missing goodbye reply is not a fault"
    );
}

#[tokio::test]
async fn operations_require_a_started_engine() {
    let net = TestNet::default();
    let transport = TestTransport::new(&net, PeerId::random(), vec![]);
    let engine = ReqResp::new(
        ReqRespConfig::default(),
        transport,
        Arc::new(RecordingScoring::default()),
    );

    let err = engine
        .send_request(SubProtocol::Ping, Bytes::new())
        .await
        .expect_err("a created engine serves no requests");
    assert!(err.to_string().contains("not started"), "unexpected error: {err}");

    engine
        .start(SubProtocolRegistry::default())
        .expect("a fresh engine starts");
    let _err = engine
        .start(SubProtocolRegistry::default())
        .expect_err("starting twice is refused");

    engine.stop().expect("a started engine stops");
    let _err = engine.stop().expect_err("stopping twice is refused");

    let err = engine
        .send_request(SubProtocol::Ping, Bytes::new())
        .await
        .expect_err("a stopped engine serves no requests");
    assert!(err.to_string().contains("stopped"), "unexpected error: {err}");
}

#[tokio::test]
async fn start_fails_fast_on_an_incomplete_registry() {
    let net = TestNet::default();
    let transport = TestTransport::new(&net, PeerId::random(), vec![]);
    let engine = ReqResp::new(
        ReqRespConfig::default(),
        transport,
        Arc::new(RecordingScoring::default()),
    );

    let err = engine
        .start(SubProtocolRegistry::empty())
        .expect_err("an empty registry must be rejected");
    assert!(
        err.to_string().contains("no handler registered"),
        "unexpected error: {err}"
    );

    engine
        .start(SubProtocolRegistry::default())
        .expect("the rejected start leaves the engine startable");
}
