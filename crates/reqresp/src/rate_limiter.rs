//! Per-peer and global request quotas, tracked per sub-protocol over fixed
//! windows.

use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use calimero_reqresp_primitives::protocol::SubProtocol;
use libp2p::PeerId;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::trace;

use crate::config::{ProtocolRateLimits, ReqRespRateLimits};

/// How often idle per-peer counters are swept out.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a quota check. A denial is surfaced to the remote peer as a
/// protocol status, not raised as an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitStatus {
    Allowed,
    /// The peer exhausted its own budget, independent of global pressure.
    DeniedPeer,
    /// The shared budget for the sub-protocol is exhausted.
    DeniedGlobal,
}

impl fmt::Display for RateLimitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allowed => "allowed",
            Self::DeniedPeer => "peer quota exceeded",
            Self::DeniedGlobal => "global quota exceeded",
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct WindowCount {
    window_start: Instant,
    count: u64,
}

impl WindowCount {
    const fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }
}

#[derive(Debug)]
struct ProtocolLimiter {
    limits: ProtocolRateLimits,
    global: WindowCount,
    peers: HashMap<PeerId, WindowCount>,
}

impl ProtocolLimiter {
    fn new(limits: ProtocolRateLimits, now: Instant) -> Self {
        Self {
            limits,
            global: WindowCount::new(now),
            peers: HashMap::new(),
        }
    }

    /// Checks the peer quota before the global one so a peer-level denial is
    /// attributable to that peer regardless of global pressure. Denials do
    /// not charge either counter.
    fn allow(&mut self, peer_id: PeerId, now: Instant) -> RateLimitStatus {
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| WindowCount::new(now));

        if now.duration_since(peer.window_start) >= self.limits.peer.quota_window {
            *peer = WindowCount::new(now);
        }

        if peer.count >= self.limits.peer.quota_count {
            return RateLimitStatus::DeniedPeer;
        }

        if now.duration_since(self.global.window_start) >= self.limits.global.quota_window {
            self.global = WindowCount::new(now);
        }

        if self.global.count >= self.limits.global.quota_count {
            return RateLimitStatus::DeniedGlobal;
        }

        self.global.count += 1;
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.count += 1;
        }

        RateLimitStatus::Allowed
    }

    fn prune(&mut self, now: Instant) {
        self.peers
            .retain(|_, window| now.duration_since(window.window_start) < self.limits.peer.quota_window);
    }
}

/// Quota tracker shared by all inbound stream handlers.
#[derive(Debug)]
pub struct RequestResponseRateLimiter {
    limiters: Arc<Mutex<HashMap<SubProtocol, ProtocolLimiter>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RequestResponseRateLimiter {
    #[must_use]
    pub fn new(limits: &ReqRespRateLimits) -> Self {
        let now = Instant::now();
        let limiters = SubProtocol::ALL
            .into_iter()
            .map(|protocol| (protocol, ProtocolLimiter::new(limits.get(protocol), now)))
            .collect();

        Self {
            limiters: Arc::new(Mutex::new(limiters)),
            sweeper: Mutex::new(None),
        }
    }

    pub fn allow(&self, protocol: SubProtocol, peer_id: PeerId) -> RateLimitStatus {
        let mut limiters = self.limiters.lock().expect("rate limiter lock poisoned");

        limiters
            .get_mut(&protocol)
            .map_or(RateLimitStatus::Allowed, |limiter| {
                limiter.allow(peer_id, Instant::now())
            })
    }

    /// Starts the periodic sweep of idle per-peer counters.
    pub fn start(&self) {
        let limiters = Arc::clone(&self.limiters);

        let task = tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let _instant = ticker.tick().await;

                let now = Instant::now();
                let mut limiters = limiters.lock().expect("rate limiter lock poisoned");
                for limiter in limiters.values_mut() {
                    limiter.prune(now);
                }

                trace!("swept idle rate limit counters");
            }
        });

        *self.sweeper.lock().expect("sweeper lock poisoned") = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            task.abort();
        }
    }
}
