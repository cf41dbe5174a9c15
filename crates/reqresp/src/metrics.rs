//! Engine metrics, registered into a caller-supplied Prometheus registry.

use calimero_reqresp_primitives::protocol::SubProtocol;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::rate_limiter::RateLimitStatus;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProtocolLabels {
    protocol: String,
}

impl ProtocolLabels {
    fn new(protocol: SubProtocol) -> Self {
        Self {
            protocol: protocol.as_str().to_owned(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ScopeLabels {
    scope: String,
}

/// Counters for both directions of the protocol. An unregistered default is
/// fully functional, which keeps tests free of registry plumbing.
#[derive(Clone, Debug, Default)]
pub struct ReqRespMetrics {
    requests_sent: Family<ProtocolLabels, Counter>,
    request_errors: Family<ProtocolLabels, Counter>,
    requests_received: Family<ProtocolLabels, Counter>,
    response_errors: Family<ProtocolLabels, Counter>,
    rate_limit_denials: Family<ScopeLabels, Counter>,
}

impl ReqRespMetrics {
    /// Creates and registers the metric families.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "reqresp_requests_sent",
            "Outbound requests issued, by sub-protocol",
            metrics.requests_sent.clone(),
        );
        registry.register(
            "reqresp_request_errors",
            "Outbound requests that failed, by sub-protocol",
            metrics.request_errors.clone(),
        );
        registry.register(
            "reqresp_requests_received",
            "Inbound requests accepted for handling, by sub-protocol",
            metrics.requests_received.clone(),
        );
        registry.register(
            "reqresp_response_errors",
            "Inbound requests that could not be answered, by sub-protocol",
            metrics.response_errors.clone(),
        );
        registry.register(
            "reqresp_rate_limit_denials",
            "Inbound requests denied by the rate limiter, by quota scope",
            metrics.rate_limit_denials.clone(),
        );

        metrics
    }

    pub(crate) fn record_request_sent(&self, protocol: SubProtocol) {
        let _count = self
            .requests_sent
            .get_or_create(&ProtocolLabels::new(protocol))
            .inc();
    }

    pub(crate) fn record_request_error(&self, protocol: SubProtocol) {
        let _count = self
            .request_errors
            .get_or_create(&ProtocolLabels::new(protocol))
            .inc();
    }

    pub(crate) fn record_request_received(&self, protocol: SubProtocol) {
        let _count = self
            .requests_received
            .get_or_create(&ProtocolLabels::new(protocol))
            .inc();
    }

    pub(crate) fn record_response_error(&self, protocol: SubProtocol) {
        let _count = self
            .response_errors
            .get_or_create(&ProtocolLabels::new(protocol))
            .inc();
    }

    pub(crate) fn record_rate_limit_denial(&self, status: RateLimitStatus) {
        let scope = match status {
            RateLimitStatus::Allowed => return,
            RateLimitStatus::DeniedPeer => "peer",
            RateLimitStatus::DeniedGlobal => "global",
        };

        let _count = self
            .rate_limit_denials
            .get_or_create(&ScopeLabels {
                scope: scope.to_owned(),
            })
            .inc();
    }
}
