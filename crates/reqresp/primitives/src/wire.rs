//! Wire framing for request/response streams.
//!
//! A request stream carries the raw request payload and is half-closed by the
//! requester. A response stream starts with exactly one status byte, followed
//! by the lz4-compressed payload when the status is `Success`; the end of the
//! stream delimits the message.

use std::io;

use bytes::Bytes;
use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;

use crate::status::{ReqRespResponse, ReqRespStatus, StatusError};

/// Upper bound on a single request or decompressed response payload.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1_024 * 1_024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("malformed compressed payload")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[must_use]
pub fn compress_payload(payload: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(payload)
}

/// Decompresses a size-prepended lz4 block, validating the claimed
/// uncompressed length before allocating.
pub fn decompress_payload(compressed: &[u8], limit: usize) -> Result<Vec<u8>, WireError> {
    let (size, _rest) = lz4_flex::block::uncompressed_size(compressed)?;

    if size > limit {
        return Err(WireError::MessageTooLarge { size, limit });
    }

    Ok(lz4_flex::decompress_size_prepended(compressed)?)
}

/// Writes a request payload and half-closes the stream so the responder
/// observes the end of the request.
pub async fn write_request<S>(stream: &mut S, payload: &[u8]) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(payload).await?;
    stream.close().await?;

    Ok(())
}

/// Reads a request payload up to the peer's half-close.
pub async fn read_request<S>(stream: &mut S, limit: usize) -> Result<Vec<u8>, WireError>
where
    S: AsyncRead + Unpin,
{
    let mut payload = Vec::new();
    let mut limited = stream.take(limit as u64 + 1);
    let _read = limited.read_to_end(&mut payload).await?;

    if payload.len() > limit {
        return Err(WireError::MessageTooLarge {
            size: payload.len(),
            limit,
        });
    }

    Ok(payload)
}

/// Writes a response: the status byte, then the compressed payload when the
/// status is `Success`. The stream is flushed but left open for the caller to
/// close.
pub async fn write_response<S>(
    stream: &mut S,
    status: ReqRespStatus,
    payload: &[u8],
) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[status.as_byte()]).await?;

    if status == ReqRespStatus::Success && !payload.is_empty() {
        stream.write_all(&compress_payload(payload)).await?;
    }

    stream.flush().await?;

    Ok(())
}

/// Reads a response stream to completion.
///
/// A stream that ends without a status byte, carries an unrecognized status,
/// or carries an undecodable payload degrades to an `Unknown`-status response;
/// transport I/O failures propagate so the caller can classify them.
pub async fn read_response<S>(stream: &mut S, limit: usize) -> Result<ReqRespResponse, WireError>
where
    S: AsyncRead + Unpin,
{
    let mut status_byte = [0_u8; 1];
    let read = stream.read(&mut status_byte).await?;

    if read == 0 {
        return Ok(ReqRespResponse::with_status(ReqRespStatus::Unknown));
    }

    let status = match ReqRespStatus::try_from(status_byte[0]) {
        Ok(status) => status,
        Err(err) => return Ok(ReqRespResponse::with_status(err.status())),
    };

    if status != ReqRespStatus::Success {
        return Ok(ReqRespResponse::with_status(status));
    }

    let mut compressed = Vec::new();
    let mut limited = stream.take(limit as u64 + 1);
    let _read = limited.read_to_end(&mut compressed).await?;

    if compressed.is_empty() {
        return Ok(ReqRespResponse::with_status(ReqRespStatus::Success));
    }

    match decompress_payload(&compressed, limit) {
        Ok(data) => Ok(ReqRespResponse {
            status,
            data: Bytes::from(data),
        }),
        Err(WireError::Io(err)) => Err(WireError::Io(err)),
        Err(_) => Ok(ReqRespResponse::with_status(ReqRespStatus::Unknown)),
    }
}
