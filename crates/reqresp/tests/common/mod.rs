//! In-memory transport and node harness for engine tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use calimero_reqresp::config::ReqRespConfig;
use calimero_reqresp::primitives::protocol::{
    GoodbyeRequest, StateDeltaRequest, StateDeltaResponse, WireMessage,
};
use calimero_reqresp::primitives::scoring::{PeerErrorSeverity, PeerScoring};
use calimero_reqresp::registry::{SubProtocolHandler, SubProtocolRegistry};
use calimero_reqresp::transport::{Transport, TransportError};
use calimero_reqresp::ReqResp;
use eyre::Result as EyreResult;
use libp2p::{PeerId, StreamProtocol};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

const STREAM_BUFFER: usize = 64 * 1_024;

pub type TestStream = Compat<DuplexStream>;

/// Scripted behavior for a peer that exists only on the wire.
#[derive(Clone, Debug)]
pub enum Script {
    /// Read the request, then answer with these raw wire bytes.
    Reply(Vec<u8>),
    /// Accept the stream and never answer.
    Silent,
    /// Refuse the dial outright.
    RefuseDial,
}

/// Shared wiring between every [`TestTransport`] of one test.
#[derive(Clone, Default)]
pub struct TestNet {
    inner: Arc<Mutex<NetInner>>,
}

#[derive(Default)]
struct NetInner {
    acceptors: HashMap<(PeerId, StreamProtocol), mpsc::UnboundedSender<(PeerId, TestStream)>>,
    scripts: HashMap<PeerId, Script>,
    parked: Vec<DuplexStream>,
}

impl TestNet {
    pub fn script_peer(&self, script: Script) -> PeerId {
        let peer_id = PeerId::random();
        let _previous = self
            .inner
            .lock()
            .expect("net lock poisoned")
            .scripts
            .insert(peer_id, script);

        peer_id
    }
}

/// Transport over in-memory duplex pipes, routing dials either to a scripted
/// peer or to the accept queue of another node on the same [`TestNet`].
pub struct TestTransport {
    local_peer: PeerId,
    peers: Mutex<Vec<PeerId>>,
    net: TestNet,
}

impl TestTransport {
    pub fn new(net: &TestNet, local_peer: PeerId, peers: Vec<PeerId>) -> Arc<Self> {
        Arc::new(Self {
            local_peer,
            peers: Mutex::new(peers),
            net: net.clone(),
        })
    }
}

#[async_trait]
impl Transport for TestTransport {
    type Stream = TestStream;
    type IncomingStreams = UnboundedReceiverStream<(PeerId, TestStream)>;

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<TestStream, TransportError> {
        let script = self
            .net
            .inner
            .lock()
            .expect("net lock poisoned")
            .scripts
            .get(&peer_id)
            .cloned();

        if let Some(script) = script {
            return match script {
                Script::RefuseDial => Err(TransportError::Io(io::Error::from(
                    io::ErrorKind::ConnectionRefused,
                ))),
                Script::Silent => {
                    let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
                    self.net
                        .inner
                        .lock()
                        .expect("net lock poisoned")
                        .parked
                        .push(remote);

                    Ok(local.compat())
                }
                Script::Reply(bytes) => {
                    let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
                    drop(tokio::spawn(async move {
                        use futures_util::io::{AsyncReadExt, AsyncWriteExt};

                        let mut remote = remote.compat();
                        let mut request = Vec::new();
                        let _read = remote.read_to_end(&mut request).await;
                        let _written = remote.write_all(&bytes).await;
                        let _closed = remote.close().await;
                    }));

                    Ok(local.compat())
                }
            };
        }

        let sender = self
            .net
            .inner
            .lock()
            .expect("net lock poisoned")
            .acceptors
            .get(&(peer_id, protocol.clone()))
            .cloned()
            .ok_or_else(|| {
                TransportError::Connection(format!("peer {peer_id} is not listening on {protocol}"))
            })?;

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        sender
            .send((self.local_peer, remote.compat()))
            .map_err(|_send_error| TransportError::Connection("peer stopped accepting".to_owned()))?;

        Ok(local.compat())
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<Self::IncomingStreams, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _previous = self
            .net
            .inner
            .lock()
            .expect("net lock poisoned")
            .acceptors
            .insert((self.local_peer, protocol), sender);

        Ok(UnboundedReceiverStream::new(receiver))
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.lock().expect("peer list lock poisoned").clone()
    }
}

/// Scoring stub that records every penalty it is handed.
#[derive(Clone, Default)]
pub struct RecordingScoring {
    penalties: Arc<Mutex<Vec<(PeerId, PeerErrorSeverity)>>>,
}

impl RecordingScoring {
    pub fn penalties(&self) -> Vec<(PeerId, PeerErrorSeverity)> {
        self.penalties.lock().expect("penalties lock poisoned").clone()
    }
}

impl PeerScoring for RecordingScoring {
    fn penalize_peer(&self, peer_id: PeerId, severity: PeerErrorSeverity) {
        self.penalties
            .lock()
            .expect("penalties lock poisoned")
            .push((peer_id, severity));
    }
}

/// Answers state delta requests with the little-endian height bytes and
/// records the heights it served.
#[derive(Clone, Default)]
pub struct DeltaHandler {
    served: Arc<Mutex<Vec<u64>>>,
}

impl DeltaHandler {
    pub fn served(&self) -> Vec<u64> {
        self.served.lock().expect("served lock poisoned").clone()
    }
}

#[async_trait]
impl SubProtocolHandler for DeltaHandler {
    async fn handle(&self, _peer_id: PeerId, request: &[u8]) -> EyreResult<Bytes> {
        let request = StateDeltaRequest::from_bytes(request)?;
        self.served
            .lock()
            .expect("served lock poisoned")
            .push(request.height);

        Ok(StateDeltaResponse {
            delta: request.height.to_le_bytes().to_vec(),
        }
        .to_bytes())
    }
}

/// Records the goodbye reasons it has been handed.
#[derive(Clone, Default)]
pub struct GoodbyeHandler {
    received: Arc<Mutex<Vec<GoodbyeRequest>>>,
}

impl GoodbyeHandler {
    pub fn received(&self) -> Vec<GoodbyeRequest> {
        self.received.lock().expect("received lock poisoned").clone()
    }
}

#[async_trait]
impl SubProtocolHandler for GoodbyeHandler {
    async fn handle(&self, _peer_id: PeerId, request: &[u8]) -> EyreResult<Bytes> {
        let request = GoodbyeRequest::from_bytes(request)?;
        self.received
            .lock()
            .expect("received lock poisoned")
            .push(request);

        Ok(Bytes::new())
    }
}

pub struct TestNode {
    pub peer_id: PeerId,
    pub engine: ReqResp<TestTransport>,
    pub transport: Arc<TestTransport>,
    pub scoring: RecordingScoring,
}

/// Builds and starts a node on `net`, connected to `peers`.
pub fn start_node(
    net: &TestNet,
    config: ReqRespConfig,
    peers: Vec<PeerId>,
    registry: SubProtocolRegistry,
) -> TestNode {
    let peer_id = PeerId::random();
    let transport = TestTransport::new(net, peer_id, peers);
    let scoring = RecordingScoring::default();
    let engine = ReqResp::new(config, Arc::clone(&transport), Arc::new(scoring.clone()));

    engine.start(registry).expect("engine should start");

    TestNode {
        peer_id,
        engine,
        transport,
        scoring,
    }
}
