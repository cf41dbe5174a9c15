//! Fault taxonomy and the peer error classifier.

use std::io;

use calimero_reqresp_primitives::protocol::SubProtocol;
use calimero_reqresp_primitives::scoring::PeerErrorSeverity;
use calimero_reqresp_primitives::status::ReqRespStatus;
use calimero_reqresp_primitives::wire::WireError;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rate_limiter::RateLimitStatus;
use crate::transport::TransportError;

/// Faults raised while serving or issuing requests.
///
/// These never propagate to callers of the engine's request operations; they
/// are classified into an optional reputation penalty and degraded into
/// `Failure` responses, peer eviction or error-status chunks.
#[derive(Debug, Error)]
pub enum ReqRespError {
    #[error("failed to dial peer")]
    Dial(#[source] TransportError),
    #[error("timed out dialing peer")]
    DialTimeout,
    #[error("individual request timed out")]
    IndividualTimeout,
    #[error("batch request deadline exceeded")]
    CollectiveTimeout,
    #[error("operation aborted locally")]
    Aborted,
    #[error("peer responded with status {0}")]
    Status(ReqRespStatus),
    #[error("malformed response payload")]
    Decode(#[source] io::Error),
    #[error("response failed validation")]
    InvalidResponse,
    #[error("request handler failed: {0}")]
    Handler(eyre::Report),
    #[error("rate limit exceeded: {0}")]
    RateLimited(RateLimitStatus),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<WireError> for ReqRespError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(err) => Self::Io(err),
            other => Self::Decode(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}

/// Maps a fault to the reputation penalty it deserves, if any.
///
/// Returning `None` means the peer is not at fault: goodbye streams expect no
/// reply, collective timeouts and invalid responses are triggered on our
/// side, and locally aborted or locally closed connections say nothing about
/// the peer.
pub(crate) fn classify(
    error: &ReqRespError,
    protocol: SubProtocol,
) -> Option<PeerErrorSeverity> {
    if !protocol.expects_response() {
        debug!(%protocol, "error on a no-reply sub-protocol, no penalty");
        return None;
    }

    match error {
        ReqRespError::CollectiveTimeout
        | ReqRespError::InvalidResponse
        | ReqRespError::Decode(_)
        | ReqRespError::Aborted
        | ReqRespError::Status(_)
        | ReqRespError::Handler(_) => None,

        ReqRespError::RateLimited(status) => match status {
            RateLimitStatus::DeniedPeer => Some(PeerErrorSeverity::HighToleranceError),
            RateLimitStatus::Allowed | RateLimitStatus::DeniedGlobal => None,
        },

        ReqRespError::Io(err) => match err.kind() {
            // We closed the connection ourselves.
            io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected => None,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Some(PeerErrorSeverity::HighToleranceError),
            _ => {
                warn!(%protocol, error = %err, "unclassified transport error");
                Some(PeerErrorSeverity::HighToleranceError)
            }
        },

        ReqRespError::Dial(_) | ReqRespError::DialTimeout | ReqRespError::IndividualTimeout => {
            Some(PeerErrorSeverity::HighToleranceError)
        }
    }
}
