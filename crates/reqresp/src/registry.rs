//! Typed sub-protocol registry: one handler and one response validator per
//! [`SubProtocol`], validated for completeness when the engine starts.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use calimero_reqresp_primitives::protocol::SubProtocol;
use eyre::{bail, Result as EyreResult};
use libp2p::PeerId;

/// Serves inbound requests for one sub-protocol.
#[async_trait]
pub trait SubProtocolHandler: Send + Sync {
    async fn handle(&self, peer_id: PeerId, request: &[u8]) -> EyreResult<Bytes>;
}

/// Judges whether a response answers the request it was issued for.
#[async_trait]
pub trait ResponseValidator: Send + Sync {
    async fn validate(&self, peer_id: PeerId, request: &[u8], response: &[u8])
        -> EyreResult<bool>;
}

/// Echoes the request payload back.
#[derive(Clone, Copy, Debug, Default)]
pub struct PingHandler;

#[async_trait]
impl SubProtocolHandler for PingHandler {
    async fn handle(&self, _peer_id: PeerId, request: &[u8]) -> EyreResult<Bytes> {
        Ok(Bytes::copy_from_slice(request))
    }
}

/// Acknowledges without producing a payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyHandler;

#[async_trait]
impl SubProtocolHandler for EmptyHandler {
    async fn handle(&self, _peer_id: PeerId, _request: &[u8]) -> EyreResult<Bytes> {
        Ok(Bytes::new())
    }
}

/// Accepts every response.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl ResponseValidator for AcceptAllValidator {
    async fn validate(
        &self,
        _peer_id: PeerId,
        _request: &[u8],
        _response: &[u8],
    ) -> EyreResult<bool> {
        Ok(true)
    }
}

#[derive(Clone)]
pub struct SubProtocolRegistry {
    handlers: HashMap<SubProtocol, Arc<dyn SubProtocolHandler>>,
    validators: HashMap<SubProtocol, Arc<dyn ResponseValidator>>,
}

impl SubProtocolRegistry {
    /// A registry with no entries; every sub-protocol must be filled in
    /// before the engine will start.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            validators: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_handler(
        mut self,
        protocol: SubProtocol,
        handler: Arc<dyn SubProtocolHandler>,
    ) -> Self {
        let _previous = self.handlers.insert(protocol, handler);
        self
    }

    #[must_use]
    pub fn with_validator(
        mut self,
        protocol: SubProtocol,
        validator: Arc<dyn ResponseValidator>,
    ) -> Self {
        let _previous = self.validators.insert(protocol, validator);
        self
    }

    pub(crate) fn handler(&self, protocol: SubProtocol) -> Option<Arc<dyn SubProtocolHandler>> {
        self.handlers.get(&protocol).cloned()
    }

    pub(crate) fn validator(&self, protocol: SubProtocol) -> Option<Arc<dyn ResponseValidator>> {
        self.validators.get(&protocol).cloned()
    }

    /// Fails fast when any sub-protocol is missing an entry.
    pub(crate) fn ensure_complete(&self) -> EyreResult<()> {
        for protocol in SubProtocol::ALL {
            if !self.handlers.contains_key(&protocol) {
                bail!("no handler registered for sub-protocol {protocol}");
            }
            if !self.validators.contains_key(&protocol) {
                bail!("no response validator registered for sub-protocol {protocol}");
            }
        }

        Ok(())
    }
}

impl Default for SubProtocolRegistry {
    /// The default table: ping echoes, everything else acknowledges with an
    /// empty payload, and every response is accepted.
    fn default() -> Self {
        let mut registry = Self::empty();

        for protocol in SubProtocol::ALL {
            let handler: Arc<dyn SubProtocolHandler> = match protocol {
                SubProtocol::Ping => Arc::new(PingHandler),
                SubProtocol::Goodbye | SubProtocol::StateDelta | SubProtocol::Blob => {
                    Arc::new(EmptyHandler)
                }
            };

            registry = registry
                .with_handler(protocol, handler)
                .with_validator(protocol, Arc::new(AcceptAllValidator));
        }

        registry
    }
}

impl fmt::Debug for SubProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubProtocolRegistry")
            .field("handlers", &self.handlers.keys())
            .field("validators", &self.validators.keys())
            .finish()
    }
}
