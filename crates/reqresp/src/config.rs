//! Engine configuration with per-sub-protocol rate limit defaults.

use std::collections::HashMap;
use std::time::Duration;

use calimero_reqresp_primitives::protocol::SubProtocol;
use calimero_reqresp_primitives::wire::MAX_MESSAGE_SIZE;

/// Default deadline for an entire batch call.
pub const DEFAULT_OVERALL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a single request/response exchange.
pub const DEFAULT_INDIVIDUAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Default budget for opening a stream to a peer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Default retry rounds for a batch call.
pub const DEFAULT_BATCH_RETRY_ATTEMPTS: usize = 3;

/// Minimum peer fan-out for a batch call when the caller does not pick one.
pub const DEFAULT_MIN_BATCH_PEERS: usize = 10;

#[derive(Clone, Debug)]
pub struct ReqRespConfig {
    /// Deadline for an entire batch call.
    pub overall_request_timeout: Duration,

    /// Deadline for a single request/response exchange.
    pub individual_request_timeout: Duration,

    /// Budget for opening a stream to a peer.
    pub dial_timeout: Duration,

    /// Upper bound on request and decompressed response payloads.
    pub max_message_size: usize,

    /// Per-sub-protocol quota table.
    pub rate_limits: ReqRespRateLimits,
}

impl Default for ReqRespConfig {
    fn default() -> Self {
        Self {
            overall_request_timeout: DEFAULT_OVERALL_REQUEST_TIMEOUT,
            individual_request_timeout: DEFAULT_INDIVIDUAL_REQUEST_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
            rate_limits: ReqRespRateLimits::default(),
        }
    }
}

/// A request budget over a fixed window.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitQuota {
    pub quota_count: u64,
    pub quota_window: Duration,
}

impl RateLimitQuota {
    #[must_use]
    pub const fn per_second(quota_count: u64) -> Self {
        Self {
            quota_count,
            quota_window: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProtocolRateLimits {
    /// Budget of a single peer.
    pub peer: RateLimitQuota,

    /// Budget shared by all peers.
    pub global: RateLimitQuota,
}

const FALLBACK_RATE_LIMITS: ProtocolRateLimits = ProtocolRateLimits {
    peer: RateLimitQuota::per_second(5),
    global: RateLimitQuota::per_second(100),
};

/// Per-sub-protocol quota table, fully populated by default and overridable
/// per deployment.
#[derive(Clone, Debug)]
pub struct ReqRespRateLimits {
    limits: HashMap<SubProtocol, ProtocolRateLimits>,
}

impl Default for ReqRespRateLimits {
    fn default() -> Self {
        let mut limits = HashMap::new();

        for protocol in SubProtocol::ALL {
            let defaults = match protocol {
                SubProtocol::Ping => ProtocolRateLimits {
                    peer: RateLimitQuota::per_second(10),
                    global: RateLimitQuota::per_second(200),
                },
                SubProtocol::Goodbye => ProtocolRateLimits {
                    peer: RateLimitQuota::per_second(2),
                    global: RateLimitQuota::per_second(50),
                },
                SubProtocol::StateDelta => ProtocolRateLimits {
                    peer: RateLimitQuota::per_second(50),
                    global: RateLimitQuota::per_second(500),
                },
                SubProtocol::Blob => ProtocolRateLimits {
                    peer: RateLimitQuota::per_second(10),
                    global: RateLimitQuota::per_second(100),
                },
            };

            let _previous = limits.insert(protocol, defaults);
        }

        Self { limits }
    }
}

impl ReqRespRateLimits {
    #[must_use]
    pub fn get(&self, protocol: SubProtocol) -> ProtocolRateLimits {
        self.limits
            .get(&protocol)
            .copied()
            .unwrap_or(FALLBACK_RATE_LIMITS)
    }

    pub fn set(&mut self, protocol: SubProtocol, limits: ProtocolRateLimits) {
        let _previous = self.limits.insert(protocol, limits);
    }
}

/// Per-call knobs for [`crate::ReqResp::send_batch_request`].
#[derive(Clone, Copy, Debug)]
pub struct BatchRequestOptions {
    /// Deadline for the whole batch call.
    pub timeout: Duration,

    /// Target number of distinct peers; defaults to
    /// `max(DEFAULT_MIN_BATCH_PEERS, ceil(requests / 3))` when unset.
    pub max_peers: Option<usize>,

    /// Retry rounds before giving up on still-unanswered indices.
    pub max_retry_attempts: usize,
}

impl Default for BatchRequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_OVERALL_REQUEST_TIMEOUT,
            max_peers: None,
            max_retry_attempts: DEFAULT_BATCH_RETRY_ATTEMPTS,
        }
    }
}
