//! The request/response engine.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use calimero_reqresp_primitives::protocol::{SubProtocol, SubProtocolSpec, WireMessage};
use calimero_reqresp_primitives::scoring::PeerScoring;
use calimero_reqresp_primitives::status::{ReqRespResponse, ReqRespStatus};
use calimero_reqresp_primitives::wire;
use eyre::{bail, Result as EyreResult};
use futures_util::io::AsyncWriteExt;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use libp2p::PeerId;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::config::{BatchRequestOptions, ReqRespConfig, DEFAULT_MIN_BATCH_PEERS};
use crate::connection_sampler::batch::BatchConnectionSampler;
use crate::connection_sampler::ConnectionSampler;
use crate::error::{classify, ReqRespError};
use crate::metrics::ReqRespMetrics;
use crate::rate_limiter::{RateLimitStatus, RequestResponseRateLimiter};
use crate::registry::SubProtocolRegistry;
use crate::transport::Transport;

/// The request/response service.
///
/// Lets the node request specific information from peers and answer the same
/// requests in turn, covering recovery of data missed during gossip delivery
/// or while offline.
///
/// Cheap to clone; all clones share one engine.
pub struct ReqResp<T: Transport> {
    inner: Arc<ReqRespInner<T>>,
}

struct ReqRespInner<T: Transport> {
    config: ReqRespConfig,
    transport: Arc<T>,
    sampler: ConnectionSampler<T>,
    rate_limiter: RequestResponseRateLimiter,
    peer_scoring: Arc<dyn PeerScoring>,
    metrics: ReqRespMetrics,
    state: Mutex<ServiceState>,
}

enum ServiceState {
    Created,
    Started {
        registry: Arc<SubProtocolRegistry>,
        accept_tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

impl<T: Transport> Clone for ReqResp<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for ReqResp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqResp").finish_non_exhaustive()
    }
}

impl<T: Transport> ReqResp<T> {
    pub fn new(
        config: ReqRespConfig,
        transport: Arc<T>,
        peer_scoring: Arc<dyn PeerScoring>,
    ) -> Self {
        Self::with_metrics(config, transport, peer_scoring, ReqRespMetrics::default())
    }

    pub fn with_metrics(
        config: ReqRespConfig,
        transport: Arc<T>,
        peer_scoring: Arc<dyn PeerScoring>,
        metrics: ReqRespMetrics,
    ) -> Self {
        let rate_limiter = RequestResponseRateLimiter::new(&config.rate_limits);
        let sampler = ConnectionSampler::new(Arc::clone(&transport));

        Self {
            inner: Arc::new(ReqRespInner {
                config,
                transport,
                sampler,
                rate_limiter,
                peer_scoring,
                metrics,
                state: Mutex::new(ServiceState::Created),
            }),
        }
    }

    /// Registers an accept loop per sub-protocol with the transport and
    /// starts the rate limiter. Fails fast when the registry is missing an
    /// entry for any sub-protocol. Not re-entrant.
    pub fn start(&self, registry: SubProtocolRegistry) -> EyreResult<()> {
        registry.ensure_complete()?;

        let mut state = self.inner.state.lock().expect("service state lock poisoned");

        if !matches!(*state, ServiceState::Created) {
            bail!("reqresp service can only be started from its created state");
        }

        let mut incomings = Vec::with_capacity(SubProtocol::ALL.len());
        for protocol in SubProtocol::ALL {
            incomings.push((
                protocol,
                self.inner.transport.accept(protocol.stream_protocol())?,
            ));
        }

        let mut accept_tasks = Vec::with_capacity(incomings.len());
        for (protocol, incoming) in incomings {
            let service = self.clone();
            accept_tasks.push(tokio::spawn(async move {
                service.accept_loop(protocol, incoming).await;
            }));
        }

        self.inner.rate_limiter.start();

        *state = ServiceState::Started {
            registry: Arc::new(registry),
            accept_tasks,
        };

        debug!("reqresp service started");

        Ok(())
    }

    /// Unregisters the stream handlers, cancels streams the engine opened
    /// and stops the rate limiter.
    pub fn stop(&self) -> EyreResult<()> {
        let mut state = self.inner.state.lock().expect("service state lock poisoned");

        match mem::replace(&mut *state, ServiceState::Stopped) {
            ServiceState::Started {
                accept_tasks,
                registry: _,
            } => {
                for task in accept_tasks {
                    task.abort();
                }
            }
            ServiceState::Created => {
                *state = ServiceState::Created;
                bail!("reqresp service was never started");
            }
            ServiceState::Stopped => bail!("reqresp service already stopped"),
        }

        drop(state);

        self.inner.sampler.stop();
        self.inner.rate_limiter.stop();

        debug!("reqresp service stopped");

        Ok(())
    }

    fn started_registry(&self) -> EyreResult<Arc<SubProtocolRegistry>> {
        let state = self.inner.state.lock().expect("service state lock poisoned");

        match &*state {
            ServiceState::Started { registry, .. } => Ok(Arc::clone(registry)),
            ServiceState::Created => bail!("reqresp service not started"),
            ServiceState::Stopped => bail!("reqresp service already stopped"),
        }
    }

    /// Sends a single request to a peer chosen by the sampling strategy.
    ///
    /// Degrades to a `Failure` response when no peer is connected.
    pub async fn send_request(
        &self,
        protocol: SubProtocol,
        payload: Bytes,
    ) -> EyreResult<ReqRespResponse> {
        let _registry = self.started_registry()?;

        let Some(peer_id) = self.inner.sampler.sample_peer(&HashSet::new()) else {
            warn!(%protocol, "no connected peers to send request to");
            return Ok(ReqRespResponse::failure());
        };

        Ok(self.request_peer(peer_id, protocol, &payload).await)
    }

    /// Sends a request to a specific peer.
    ///
    /// Dials a dedicated stream, writes the payload and reads the reply
    /// under the individual request timeout. Every fault is classified (and
    /// may penalize the peer) and degrades to a `Failure` response; the only
    /// error this returns is lifecycle misuse.
    pub async fn send_request_to_peer(
        &self,
        peer_id: PeerId,
        protocol: SubProtocol,
        payload: Bytes,
    ) -> EyreResult<ReqRespResponse> {
        let _registry = self.started_registry()?;

        Ok(self.request_peer(peer_id, protocol, &payload).await)
    }

    /// Requests many payloads of one sub-protocol, spread across peers.
    ///
    /// Requests going to the same peer are sent serially on fresh streams;
    /// distinct peers proceed concurrently. A peer that answers with a
    /// non-`Success` status, an undecodable payload or a validator failure
    /// is evicted from the batch and replaced where possible, and its
    /// indices are retried in the next round. A pinned peer additionally
    /// receives every pending index each round, capped at the
    /// sub-protocol's per-peer quota.
    ///
    /// The returned vector is index-aligned with `requests`; indices that
    /// were never answered with a validated response stay `None`. The whole
    /// call observes `options.timeout` and returns whatever was resolved
    /// when the deadline trips.
    pub async fn send_batch_request<P: SubProtocolSpec>(
        &self,
        requests: &[P::Request],
        pinned_peer: Option<PeerId>,
        options: BatchRequestOptions,
    ) -> EyreResult<Vec<Option<P::Response>>> {
        let registry = self.started_registry()?;

        let Some(validator) = registry.validator(P::PROTOCOL) else {
            bail!("no response validator registered for sub-protocol {}", P::PROTOCOL);
        };

        let total = requests.len();
        let request_buffers: Vec<Bytes> = requests.iter().map(WireMessage::to_bytes).collect();
        let responses: Mutex<Vec<Option<P::Response>>> =
            Mutex::new((0..total).map(|_| None).collect());

        let max_peers = options
            .max_peers
            .unwrap_or_else(|| DEFAULT_MIN_BATCH_PEERS.max(total.div_ceil(3)));
        let deadline = Instant::now() + options.timeout;

        let run = async {
            let mut pending: BTreeSet<usize> = (0..total).collect();

            let mut exclude = HashSet::new();
            if let Some(pinned) = pinned_peer {
                let _inserted = exclude.insert(pinned);
            }

            let batch_sampler =
                BatchConnectionSampler::new(&self.inner.sampler, total, max_peers, exclude);

            if batch_sampler.active_peer_count() == 0 && pinned_peer.is_none() {
                warn!(protocol = %P::PROTOCOL, "no active peers to send batch request to");
                return;
            }

            let peer_quota = self.inner.config.rate_limits.get(P::PROTOCOL).peer.quota_count;
            let peer_quota = usize::try_from(peer_quota).unwrap_or(usize::MAX);

            let mut retry_attempts = 0;
            while !pending.is_empty()
                && batch_sampler.active_peer_count() > 0
                && retry_attempts < options.max_retry_attempts
            {
                if Instant::now() >= deadline {
                    debug!(
                        protocol = %P::PROTOCOL,
                        "batch deadline reached, not starting another round"
                    );
                    return;
                }

                // Group pending indices by their assigned peer.
                let mut batches: BTreeMap<PeerId, Vec<usize>> = BTreeMap::new();
                for &index in &pending {
                    let Some(peer_id) = batch_sampler.get_peer_for_request(index) else {
                        break;
                    };

                    batches.entry(peer_id).or_default().push(index);
                }

                // The pinned peer always gets every pending index, capped at
                // its own quota so we do not trip its rate limiter.
                if let Some(pinned) = pinned_peer {
                    let indices: Vec<usize> = pending.iter().copied().take(peer_quota).collect();
                    let _previous = batches.insert(pinned, indices);
                }

                let mut rounds: FuturesUnordered<_> = batches
                    .into_iter()
                    .map(|(peer_id, indices)| {
                        let validator = Arc::clone(&validator);
                        let request_buffers = &request_buffers;
                        let batch_sampler = &batch_sampler;

                        async move {
                            let mut results = Vec::new();

                            for index in indices {
                                trace!(%peer_id, index, "sending batch request to peer");

                                let response = self
                                    .request_peer(peer_id, P::PROTOCOL, &request_buffers[index])
                                    .await;

                                if response.status != ReqRespStatus::Success {
                                    debug!(
                                        %peer_id,
                                        status = %response.status,
                                        "batch peer failed, evicting"
                                    );
                                    batch_sampler.remove_peer_and_replace(peer_id);
                                    return results;
                                }

                                if response.data.is_empty() {
                                    continue;
                                }

                                let decoded = match P::Response::from_bytes(&response.data) {
                                    Ok(decoded) => decoded,
                                    Err(err) => {
                                        debug!(
                                            %peer_id,
                                            error = %err,
                                            "undecodable batch response, evicting peer"
                                        );
                                        batch_sampler.remove_peer_and_replace(peer_id);
                                        return results;
                                    }
                                };

                                match validator
                                    .validate(peer_id, &request_buffers[index], &response.data)
                                    .await
                                {
                                    Ok(true) => results.push((index, decoded)),
                                    Ok(false) => {
                                        debug!(%peer_id, index, "response rejected by validator");
                                    }
                                    Err(err) => {
                                        debug!(
                                            %peer_id,
                                            error = %err,
                                            "response validator failed, evicting peer"
                                        );
                                        batch_sampler.remove_peer_and_replace(peer_id);
                                        return results;
                                    }
                                }
                            }

                            results
                        }
                    })
                    .collect();

                while let Some(results) = rounds.next().await {
                    let mut responses = responses.lock().expect("batch results lock poisoned");

                    for (index, response) in results {
                        responses[index] = Some(response);
                        let _removed = pending.remove(&index);
                    }
                }

                retry_attempts += 1;
            }

            if retry_attempts >= options.max_retry_attempts {
                debug!(
                    protocol = %P::PROTOCOL,
                    retry_attempts,
                    "max retry attempts reached for batch request"
                );
            }
        };

        if timeout_at(deadline, run).await.is_err() {
            debug!(
                protocol = %P::PROTOCOL,
                "batch request hit its collective deadline, returning partial results"
            );
        }

        let mut responses = responses.lock().expect("batch results lock poisoned");

        Ok(mem::take(&mut *responses))
    }

    async fn request_peer(
        &self,
        peer_id: PeerId,
        protocol: SubProtocol,
        payload: &[u8],
    ) -> ReqRespResponse {
        self.inner.metrics.record_request_sent(protocol);
        trace!(%peer_id, %protocol, "sending request to peer");

        let mut stream = match self
            .inner
            .sampler
            .dial_protocol(
                peer_id,
                protocol.stream_protocol(),
                self.inner.config.dial_timeout,
            )
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                self.handle_request_error(&err, peer_id, protocol);
                return ReqRespResponse::failure();
            }
        };

        let max_message_size = self.inner.config.max_message_size;
        let exchange = async {
            wire::write_request(&mut stream, payload).await?;
            wire::read_response(&mut stream, max_message_size).await
        };

        let response = match timeout(self.inner.config.individual_request_timeout, exchange).await
        {
            Ok(Ok(response)) => Some(response),
            Ok(Err(err)) => {
                self.handle_request_error(&err.into(), peer_id, protocol);
                None
            }
            Err(_elapsed) => {
                self.handle_request_error(&ReqRespError::IndividualTimeout, peer_id, protocol);
                None
            }
        };

        if let Err(err) = self.inner.sampler.close(stream).await {
            debug!(%peer_id, %protocol, error = %err, "error closing request stream");
        }

        response.unwrap_or_else(ReqRespResponse::failure)
    }

    fn handle_request_error(&self, error: &ReqRespError, peer_id: PeerId, protocol: SubProtocol) {
        self.inner.metrics.record_request_error(protocol);
        debug!(%peer_id, %protocol, error = %error, "request to peer failed");

        if let Some(severity) = classify(error, protocol) {
            self.inner.peer_scoring.penalize_peer(peer_id, severity);
        }
    }

    async fn accept_loop(&self, protocol: SubProtocol, mut incoming: T::IncomingStreams) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                next = incoming.next() => {
                    let Some((peer_id, stream)) = next else { break };

                    trace!(%peer_id, %protocol, "accepted inbound stream");

                    let service = self.clone();
                    let _abort = handlers.spawn(async move {
                        service.handle_stream(protocol, peer_id, stream).await;
                    });
                }
                Some(_finished) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
    }

    /// Serves one inbound stream: rate limit check, handler dispatch, and a
    /// status-prefixed reply. Faults become an error-status chunk when the
    /// stream still accepts writes, and the stream is closed on every path.
    async fn handle_stream(&self, protocol: SubProtocol, peer_id: PeerId, mut stream: T::Stream) {
        self.inner.metrics.record_request_received(protocol);

        if let Err(err) = self.serve_stream(protocol, peer_id, &mut stream).await {
            warn!(%peer_id, %protocol, error = %err, "inbound request failed");
            self.inner.metrics.record_response_error(protocol);

            if let Some(severity) = classify(&err, protocol) {
                self.inner.peer_scoring.penalize_peer(peer_id, severity);
            }

            let status = match &err {
                ReqRespError::RateLimited(_) => ReqRespStatus::RateLimitExceeded,
                _ => ReqRespStatus::Unknown,
            };

            if let Err(err) = wire::write_response(&mut stream, status, &[]).await {
                debug!(
                    %peer_id,
                    %protocol,
                    error = %err,
                    "stream closed before the error response could be sent"
                );
            }
        }

        if let Err(err) = stream.close().await {
            trace!(%peer_id, %protocol, error = %err, "error closing inbound stream");
        }
    }

    async fn serve_stream(
        &self,
        protocol: SubProtocol,
        peer_id: PeerId,
        stream: &mut T::Stream,
    ) -> Result<(), ReqRespError> {
        let rate_limit_status = self.inner.rate_limiter.allow(protocol, peer_id);
        if rate_limit_status != RateLimitStatus::Allowed {
            warn!(
                %peer_id,
                %protocol,
                status = %rate_limit_status,
                "rate limit exceeded for inbound request"
            );
            self.inner.metrics.record_rate_limit_denial(rate_limit_status);

            return Err(ReqRespError::RateLimited(rate_limit_status));
        }

        let Ok(registry) = self.started_registry() else {
            return Err(ReqRespError::Aborted);
        };
        let Some(handler) = registry.handler(protocol) else {
            return Err(ReqRespError::Aborted);
        };

        let request = wire::read_request(stream, self.inner.config.max_message_size).await?;

        let response = handler
            .handle(peer_id, &request)
            .await
            .map_err(ReqRespError::Handler)?;

        if !protocol.expects_response() {
            trace!(%peer_id, "goodbye received, not responding");
            return Ok(());
        }

        wire::write_response(stream, ReqRespStatus::Success, &response).await?;

        Ok(())
    }
}
