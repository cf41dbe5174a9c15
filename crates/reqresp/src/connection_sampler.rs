//! Samples connected peers and owns the streams it dials.
//!
//! Every stream opened here is registered until it is closed or dropped, so
//! [`ConnectionSampler::stop`] can cancel whatever is still in flight.
//! Streams opened by anyone else are never touched.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::{PeerId, StreamProtocol};
use rand::seq::SliceRandom;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace};

use crate::error::ReqRespError;
use crate::transport::Transport;

pub(crate) mod batch;

/// Strategy for choosing a peer out of the eligible candidates.
pub trait PeerSampler: Send + Sync + 'static {
    /// Chooses one of `peers`, or `None` when the slice is empty.
    fn sample(&self, peers: &[PeerId]) -> Option<PeerId>;
}

/// Uniform-random choice among the candidates.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSampler;

impl PeerSampler for RandomSampler {
    fn sample(&self, peers: &[PeerId]) -> Option<PeerId> {
        peers.choose(&mut rand::thread_rng()).copied()
    }
}

#[derive(Debug, Default)]
struct StreamRegistry {
    next_id: u64,
    active: HashMap<u64, PeerId>,
}

pub struct ConnectionSampler<T: Transport> {
    transport: Arc<T>,
    strategy: Box<dyn PeerSampler>,
    registry: Arc<Mutex<StreamRegistry>>,
    shutdown: CancellationToken,
}

impl<T: Transport> ConnectionSampler<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_strategy(transport, RandomSampler)
    }

    pub fn with_strategy(transport: Arc<T>, strategy: impl PeerSampler) -> Self {
        Self {
            transport,
            strategy: Box::new(strategy),
            registry: Arc::new(Mutex::new(StreamRegistry::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Samples one connected peer outside `exclude`, preferring peers
    /// without an active stream when any exist.
    pub fn sample_peer(&self, exclude: &HashSet<PeerId>) -> Option<PeerId> {
        let candidates: Vec<PeerId> = self
            .transport
            .connected_peers()
            .into_iter()
            .filter(|peer_id| !exclude.contains(peer_id))
            .collect();

        let busy: HashSet<PeerId> = {
            let registry = self.registry.lock().expect("stream registry lock poisoned");
            registry.active.values().copied().collect()
        };

        let free: Vec<PeerId> = candidates
            .iter()
            .filter(|peer_id| !busy.contains(peer_id))
            .copied()
            .collect();

        if free.is_empty() {
            self.strategy.sample(&candidates)
        } else {
            self.strategy.sample(&free)
        }
    }

    /// Draws up to `count` distinct peers outside `exclude`.
    pub fn sample_peers_for_batch(&self, count: usize, exclude: &HashSet<PeerId>) -> Vec<PeerId> {
        let mut excluded = exclude.clone();
        let mut picked = Vec::new();

        while picked.len() < count {
            let Some(peer_id) = self.sample_peer(&excluded) else {
                break;
            };

            picked.push(peer_id);
            let _inserted = excluded.insert(peer_id);
        }

        picked
    }

    /// Opens a stream for `protocol` against `peer_id`, failing with a
    /// dial-timeout fault once `dial_timeout` elapses.
    pub async fn dial_protocol(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
        dial_timeout: Duration,
    ) -> Result<TrackedStream<T::Stream>, ReqRespError> {
        if self.shutdown.is_cancelled() {
            return Err(ReqRespError::Aborted);
        }

        let stream = match timeout(dial_timeout, self.transport.open_stream(peer_id, protocol)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ReqRespError::Dial(err)),
            Err(_elapsed) => return Err(ReqRespError::DialTimeout),
        };

        let id = {
            let mut registry = self.registry.lock().expect("stream registry lock poisoned");
            registry.next_id += 1;
            let id = registry.next_id;
            let _previous = registry.active.insert(id, peer_id);
            id
        };

        trace!(stream_id = id, %peer_id, "opened stream");

        Ok(TrackedStream::new(
            stream,
            id,
            Arc::clone(&self.registry),
            self.shutdown.child_token(),
        ))
    }

    /// Gracefully closes a stream this sampler opened.
    pub async fn close(&self, mut stream: TrackedStream<T::Stream>) -> io::Result<()>
    where
        T::Stream: AsyncWrite + Unpin,
    {
        trace!(stream_id = stream.id(), "closing stream");
        stream.close().await
    }

    pub fn active_stream_count(&self) -> usize {
        self.registry
            .lock()
            .expect("stream registry lock poisoned")
            .active
            .len()
    }

    /// Refuses new dials and cancels I/O on every stream still registered.
    pub fn stop(&self) {
        debug!(
            active_streams = self.active_stream_count(),
            "stopping connection sampler"
        );
        self.shutdown.cancel();
    }
}

impl<T: Transport> core::fmt::Debug for ConnectionSampler<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionSampler")
            .field("active_streams", &self.active_stream_count())
            .finish_non_exhaustive()
    }
}

/// A stream dialed by the [`ConnectionSampler`]: registered until closed or
/// dropped, and cancelled when the sampler stops.
pub struct TrackedStream<S> {
    inner: S,
    id: u64,
    registry: Arc<Mutex<StreamRegistry>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    aborted: bool,
}

impl<S> TrackedStream<S> {
    fn new(
        inner: S,
        id: u64,
        registry: Arc<Mutex<StreamRegistry>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner,
            id,
            registry,
            cancelled: Box::pin(token.cancelled_owned()),
            aborted: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    fn shutdown_triggered(&mut self, cx: &mut Context<'_>) -> bool {
        if self.aborted {
            return true;
        }

        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.aborted = true;
            return true;
        }

        false
    }

    fn aborted_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "connection sampler stopped")
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.shutdown_triggered(cx) {
            return Poll::Ready(Err(Self::aborted_error()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.shutdown_triggered(cx) {
            return Poll::Ready(Err(Self::aborted_error()));
        }

        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.shutdown_triggered(cx) {
            return Poll::Ready(Err(Self::aborted_error()));
        }

        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Cleanup must succeed even after cancellation.
        if this.aborted || this.cancelled.as_mut().poll(cx).is_ready() {
            this.aborted = true;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_close(cx)
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().expect("stream registry lock poisoned");
        let _peer = registry.active.remove(&self.id);
    }
}

impl<S> core::fmt::Debug for TrackedStream<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedStream")
            .field("id", &self.id)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}
