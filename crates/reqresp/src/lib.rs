//! Request/response sub-protocol engine.
//!
//! Lets a node request specific information from its peers, covering
//! recovery of data missed during gossip delivery or while offline, and
//! answers the same requests from other peers.
//!
//! Outbound requests dial a dedicated stream per request through the
//! [`connection_sampler::ConnectionSampler`]; batched requests spread
//! logically independent requests of one sub-protocol across several peers,
//! evicting and replacing peers that fail mid-batch. Inbound streams are
//! rate limited per peer and per protocol before the registered handler
//! runs. Faults feed the peer reputation store through the error
//! classifier; they never surface to callers as errors.
//!
//! Responses are compressed by the responder and decompressed in the
//! requester's read path; see [`primitives::wire`] for the framing.

pub mod config;
pub mod connection_sampler;
pub mod error;
pub mod metrics;
pub mod rate_limiter;
pub mod registry;
mod service;
pub mod transport;

pub use calimero_reqresp_primitives as primitives;

pub use crate::service::ReqResp;
