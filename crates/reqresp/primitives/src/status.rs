use core::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Result status carried as the first byte of every response stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReqRespStatus {
    Success = 0,
    Failure = 1,
    RateLimitExceeded = 2,
    Unknown = 255,
}

impl ReqRespStatus {
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ReqRespStatus {
    type Error = StatusError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Self::Success),
            1 => Ok(Self::Failure),
            2 => Ok(Self::RateLimitExceeded),
            255 => Ok(Self::Unknown),
            other => Err(StatusError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for ReqRespStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::RateLimitExceeded => "rate limit exceeded",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("empty status chunk")]
    EmptyChunk,
    #[error("unrecognized status byte {0:#04x}")]
    UnknownStatus(u8),
}

impl StatusError {
    /// The status to report for a response that failed status parsing.
    #[must_use]
    pub const fn status(&self) -> ReqRespStatus {
        match self {
            Self::EmptyChunk | Self::UnknownStatus(_) => ReqRespStatus::Unknown,
        }
    }
}

/// Parses the leading status chunk of a response stream.
pub fn parse_status_chunk(chunk: &[u8]) -> Result<ReqRespStatus, StatusError> {
    let Some(&byte) = chunk.first() else {
        return Err(StatusError::EmptyChunk);
    };

    ReqRespStatus::try_from(byte)
}

/// A response as observed by the requester: the status byte and the
/// decompressed payload, which is empty unless the status is `Success`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReqRespResponse {
    pub status: ReqRespStatus,
    pub data: Bytes,
}

impl ReqRespResponse {
    #[must_use]
    pub const fn with_status(status: ReqRespStatus) -> Self {
        Self {
            status,
            data: Bytes::new(),
        }
    }

    #[must_use]
    pub const fn failure() -> Self {
        Self::with_status(ReqRespStatus::Failure)
    }
}
