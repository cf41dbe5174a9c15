use core::fmt;

use libp2p::PeerId;

/// Reputation penalty severities, ordered from most tolerated to least.
///
/// The scoring store decides the concrete score delta per severity; the
/// engine only ever chooses which severity a fault deserves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerErrorSeverity {
    HighToleranceError,
    MidToleranceError,
    LowToleranceError,
}

impl fmt::Display for PeerErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HighToleranceError => "high tolerance",
            Self::MidToleranceError => "mid tolerance",
            Self::LowToleranceError => "low tolerance",
        })
    }
}

/// Interface to the peer reputation store.
///
/// The engine only ever reports penalties; it never reads or resets scores.
pub trait PeerScoring: Send + Sync + 'static {
    fn penalize_peer(&self, peer_id: PeerId, severity: PeerErrorSeverity);
}
