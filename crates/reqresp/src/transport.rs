//! Transport boundary: what the engine needs from the underlying peer
//! network, and the libp2p-backed production implementation.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::io::{AsyncRead, AsyncWrite};
use futures_util::Stream;
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::{Control, IncomingStreams, OpenStreamError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("protocol {0} is already registered")]
    AlreadyRegistered(StreamProtocol),
    #[error("peer does not support protocol {0}")]
    UnsupportedProtocol(StreamProtocol),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The slice of the peer network the engine relies on.
///
/// Streams are duplex byte pipes negotiated per protocol; registering a
/// protocol yields the stream of inbound streams for it, and dropping that
/// stream unregisters the protocol again.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type IncomingStreams: Stream<Item = (PeerId, Self::Stream)> + Send + Unpin + 'static;

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, TransportError>;

    fn accept(&self, protocol: StreamProtocol) -> Result<Self::IncomingStreams, TransportError>;

    fn connected_peers(&self) -> Vec<PeerId>;
}

/// Shared view of the currently connected peers, maintained by the node's
/// swarm event loop and read by the engine's samplers.
#[derive(Clone, Debug, Default)]
pub struct ConnectedPeers {
    inner: Arc<RwLock<HashSet<PeerId>>>,
}

impl ConnectedPeers {
    pub fn insert(&self, peer_id: PeerId) {
        let _inserted = self
            .inner
            .write()
            .expect("connected peer set lock poisoned")
            .insert(peer_id);
    }

    pub fn remove(&self, peer_id: &PeerId) {
        let _removed = self
            .inner
            .write()
            .expect("connected peer set lock poisoned")
            .remove(peer_id);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.inner
            .read()
            .expect("connected peer set lock poisoned")
            .iter()
            .copied()
            .collect()
    }
}

/// Production transport over the swarm's stream behaviour.
#[derive(Clone)]
pub struct Libp2pTransport {
    control: Control,
    connected: ConnectedPeers,
}

impl Libp2pTransport {
    #[must_use]
    pub fn new(control: Control, connected: ConnectedPeers) -> Self {
        Self { control, connected }
    }
}

impl core::fmt::Debug for Libp2pTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Libp2pTransport")
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for Libp2pTransport {
    type Stream = libp2p::Stream;
    type IncomingStreams = IncomingStreams;

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, TransportError> {
        let mut control = self.control.clone();

        control
            .open_stream(peer_id, protocol)
            .await
            .map_err(|err| match err {
                OpenStreamError::UnsupportedProtocol(protocol) => {
                    TransportError::UnsupportedProtocol(protocol)
                }
                OpenStreamError::Io(err) => TransportError::Io(err),
                other => TransportError::Connection(other.to_string()),
            })
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<Self::IncomingStreams, TransportError> {
        self.control
            .clone()
            .accept(protocol.clone())
            .map_err(|_already_registered| TransportError::AlreadyRegistered(protocol))
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.snapshot()
    }
}
