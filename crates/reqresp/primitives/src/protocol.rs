use core::fmt;
use std::io;

use borsh::{BorshDeserialize, BorshSerialize};
use bytes::Bytes;
use libp2p::StreamProtocol;

pub const PING_PROTOCOL: StreamProtocol = StreamProtocol::new("/calimero/reqresp/ping/0.0.1");
pub const GOODBYE_PROTOCOL: StreamProtocol = StreamProtocol::new("/calimero/reqresp/goodbye/0.0.1");
pub const STATE_DELTA_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/calimero/reqresp/state-delta/0.0.1");
pub const BLOB_PROTOCOL: StreamProtocol = StreamProtocol::new("/calimero/reqresp/blob/0.0.1");

/// The fixed set of request/response pairs served by the engine.
///
/// Each variant maps to one libp2p stream protocol and one typed
/// request/response pair (see the [`SubProtocolSpec`] impls below).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubProtocol {
    Ping,
    Goodbye,
    StateDelta,
    Blob,
}

impl SubProtocol {
    pub const ALL: [Self; 4] = [Self::Ping, Self::Goodbye, Self::StateDelta, Self::Blob];

    #[must_use]
    pub const fn stream_protocol(self) -> StreamProtocol {
        match self {
            Self::Ping => PING_PROTOCOL,
            Self::Goodbye => GOODBYE_PROTOCOL,
            Self::StateDelta => STATE_DELTA_PROTOCOL,
            Self::Blob => BLOB_PROTOCOL,
        }
    }

    /// Goodbye is fire-and-forget: the remote peer hangs up instead of
    /// answering, so a missing reply is not a fault.
    #[must_use]
    pub const fn expects_response(self) -> bool {
        !matches!(self, Self::Goodbye)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Goodbye => "goodbye",
            Self::StateDelta => "state-delta",
            Self::Blob => "blob",
        }
    }
}

impl fmt::Display for SubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary serialization contract for request and response payloads.
///
/// The engine treats payloads as opaque bytes; this is the only thing it
/// assumes about them.
pub trait WireMessage: Sized + Send + Sync + 'static {
    fn to_bytes(&self) -> Bytes;

    fn from_bytes(bytes: &[u8]) -> io::Result<Self>;
}

/// Compile-time binding of a [`SubProtocol`] to its request/response types.
pub trait SubProtocolSpec {
    const PROTOCOL: SubProtocol;

    type Request: WireMessage;
    type Response: WireMessage;
}

macro_rules! impl_wire_message {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireMessage for $ty {
                fn to_bytes(&self) -> Bytes {
                    borsh::to_vec(self)
                        .expect("message serialization should not fail")
                        .into()
                }

                fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
                    borsh::from_slice(bytes)
                }
            }
        )*
    };
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PingRequest {
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PingResponse {
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum GoodbyeReason {
    Shutdown,
    TooManyPeers,
    Banned,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GoodbyeRequest {
    pub reason: GoodbyeReason,
}

/// Never sent on the wire; goodbye expects no reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GoodbyeResponse;

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateDeltaRequest {
    pub context_id: [u8; 32],
    pub height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateDeltaResponse {
    pub delta: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlobRequest {
    pub blob_id: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlobResponse {
    pub found: bool,
    pub data: Vec<u8>,
}

impl_wire_message!(
    PingRequest,
    PingResponse,
    GoodbyeRequest,
    GoodbyeResponse,
    StateDeltaRequest,
    StateDeltaResponse,
    BlobRequest,
    BlobResponse,
);

#[derive(Clone, Copy, Debug)]
pub struct PingProtocol;

impl SubProtocolSpec for PingProtocol {
    const PROTOCOL: SubProtocol = SubProtocol::Ping;

    type Request = PingRequest;
    type Response = PingResponse;
}

#[derive(Clone, Copy, Debug)]
pub struct GoodbyeProtocol;

impl SubProtocolSpec for GoodbyeProtocol {
    const PROTOCOL: SubProtocol = SubProtocol::Goodbye;

    type Request = GoodbyeRequest;
    type Response = GoodbyeResponse;
}

#[derive(Clone, Copy, Debug)]
pub struct StateDeltaProtocol;

impl SubProtocolSpec for StateDeltaProtocol {
    const PROTOCOL: SubProtocol = SubProtocol::StateDelta;

    type Request = StateDeltaRequest;
    type Response = StateDeltaResponse;
}

#[derive(Clone, Copy, Debug)]
pub struct BlobProtocol;

impl SubProtocolSpec for BlobProtocol {
    const PROTOCOL: SubProtocol = SubProtocol::Blob;

    type Request = BlobRequest;
    type Response = BlobResponse;
}
