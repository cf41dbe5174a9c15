//! Peer assignment for one batch call.
//!
//! Scoped to a single `send_batch_request` invocation: sampled once at
//! construction, mutated as peers fail, and discarded with the call.

use std::collections::HashSet;
use std::sync::Mutex;

use libp2p::PeerId;
use tracing::{debug, warn};

use crate::transport::Transport;

use super::ConnectionSampler;

pub(crate) struct BatchConnectionSampler<'a, T: Transport> {
    sampler: &'a ConnectionSampler<T>,
    requests_per_peer: usize,
    state: Mutex<BatchState>,
}

#[derive(Debug)]
struct BatchState {
    peers: Vec<PeerId>,
    excluded: HashSet<PeerId>,
}

impl<'a, T: Transport> BatchConnectionSampler<'a, T> {
    /// Samples up to `max_peers` distinct peers outside `exclude` and fixes
    /// the index-to-peer bucketing for the whole batch.
    pub(crate) fn new(
        sampler: &'a ConnectionSampler<T>,
        total_requests: usize,
        max_peers: usize,
        exclude: HashSet<PeerId>,
    ) -> Self {
        let peers = sampler.sample_peers_for_batch(max_peers, &exclude);
        let requests_per_peer = total_requests.div_ceil(peers.len().max(1)).max(1);

        debug!(
            peer_count = peers.len(),
            requests_per_peer, "sampled peers for batch request"
        );

        Self {
            sampler,
            requests_per_peer,
            state: Mutex::new(BatchState {
                peers,
                excluded: exclude,
            }),
        }
    }

    pub(crate) fn active_peer_count(&self) -> usize {
        self.state.lock().expect("batch state lock poisoned").peers.len()
    }

    /// Maps a pending request index to one of the active peers; `None` once
    /// no active peers remain.
    pub(crate) fn get_peer_for_request(&self, index: usize) -> Option<PeerId> {
        let state = self.state.lock().expect("batch state lock poisoned");

        if state.peers.is_empty() {
            return None;
        }

        let bucket = index / self.requests_per_peer;
        state.peers.get(bucket % state.peers.len()).copied()
    }

    /// Evicts a failing peer for the remainder of the batch and tries to
    /// draw a replacement into its slot, keeping the bucketing stable.
    pub(crate) fn remove_peer_and_replace(&self, peer_id: PeerId) {
        let mut state = self.state.lock().expect("batch state lock poisoned");

        let Some(position) = state.peers.iter().position(|peer| *peer == peer_id) else {
            return;
        };

        let _inserted = state.excluded.insert(peer_id);

        let mut exclude = state.excluded.clone();
        exclude.extend(state.peers.iter().copied());

        match self.sampler.sample_peer(&exclude) {
            Some(replacement) => {
                debug!(%peer_id, %replacement, "replaced failing batch peer");
                state.peers[position] = replacement;
            }
            None => {
                warn!(%peer_id, "no replacement peer available, shrinking batch");
                let _removed = state.peers.remove(position);
            }
        }
    }
}

impl<T: Transport> core::fmt::Debug for BatchConnectionSampler<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchConnectionSampler")
            .field("requests_per_peer", &self.requests_per_peer)
            .field("active_peers", &self.active_peer_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{FirstPeerSampler, StubTransport};
    use super::*;

    fn sampler_over(
        peers: Vec<PeerId>,
    ) -> ConnectionSampler<StubTransport> {
        ConnectionSampler::with_strategy(StubTransport::new(peers), FirstPeerSampler)
    }

    #[test]
    fn indices_are_bucketed_over_the_sampled_peers() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let sampler = sampler_over(peers.clone());
        let batch = BatchConnectionSampler::new(&sampler, 10, 3, HashSet::new());

        assert_eq!(batch.active_peer_count(), 3, "all requested peers sampled");

        for index in 0..4 {
            assert_eq!(
                batch.get_peer_for_request(index),
                Some(peers[0]),
                "index {index} belongs to the first bucket"
            );
        }
        for index in 4..8 {
            assert_eq!(
                batch.get_peer_for_request(index),
                Some(peers[1]),
                "index {index} belongs to the second bucket"
            );
        }
        for index in 8..10 {
            assert_eq!(
                batch.get_peer_for_request(index),
                Some(peers[2]),
                "index {index} belongs to the third bucket"
            );
        }
    }

    #[test]
    fn eviction_draws_a_replacement_into_the_same_slot() {
        let peers: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        let sampler = sampler_over(peers.clone());
        let batch = BatchConnectionSampler::new(&sampler, 9, 3, HashSet::new());

        assert_eq!(
            batch.get_peer_for_request(3),
            Some(peers[1]),
            "second bucket before eviction"
        );

        batch.remove_peer_and_replace(peers[1]);

        assert_eq!(batch.active_peer_count(), 3, "replacement keeps the fan-out");
        assert_eq!(
            batch.get_peer_for_request(3),
            Some(peers[3]),
            "the spare peer takes over the evicted slot"
        );
    }

    #[test]
    fn eviction_without_spare_peers_shrinks_the_active_set() {
        let peers: Vec<PeerId> = (0..2).map(|_| PeerId::random()).collect();
        let sampler = sampler_over(peers.clone());
        let batch = BatchConnectionSampler::new(&sampler, 4, 2, HashSet::new());

        batch.remove_peer_and_replace(peers[0]);

        assert_eq!(batch.active_peer_count(), 1, "no replacement available");
        assert_eq!(
            batch.get_peer_for_request(0),
            Some(peers[1]),
            "remaining indices fall to the surviving peer"
        );

        batch.remove_peer_and_replace(peers[1]);

        assert_eq!(batch.active_peer_count(), 0, "active set exhausted");
        assert_eq!(
            batch.get_peer_for_request(0),
            None,
            "no peer left to assign"
        );
    }

    #[test]
    fn evicted_peers_are_never_reassigned() {
        let peers: Vec<PeerId> = (0..2).map(|_| PeerId::random()).collect();
        let sampler = sampler_over(peers.clone());
        let batch = BatchConnectionSampler::new(&sampler, 2, 1, HashSet::new());

        assert_eq!(
            batch.get_peer_for_request(0),
            Some(peers[0]),
            "first peer assigned initially"
        );

        batch.remove_peer_and_replace(peers[0]);

        assert_eq!(
            batch.get_peer_for_request(0),
            Some(peers[1]),
            "the evicted peer must not come back, even though it is still connected"
        );
    }

    #[test]
    fn excluded_peers_are_not_sampled() {
        let peers: Vec<PeerId> = (0..2).map(|_| PeerId::random()).collect();
        let sampler = sampler_over(peers.clone());

        let mut exclude = HashSet::new();
        let _inserted = exclude.insert(peers[0]);

        let batch = BatchConnectionSampler::new(&sampler, 4, 2, exclude);

        assert_eq!(batch.active_peer_count(), 1, "only the non-excluded peer");
        assert_eq!(
            batch.get_peer_for_request(0),
            Some(peers[1]),
            "every index goes to the one eligible peer"
        );
    }

    #[test]
    fn zero_requests_still_construct() {
        let sampler = sampler_over(vec![PeerId::random()]);
        let batch = BatchConnectionSampler::new(&sampler, 0, 2, HashSet::new());

        assert_eq!(batch.active_peer_count(), 1, "peer sampled regardless");
    }
}
