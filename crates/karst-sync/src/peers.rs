//! Peer bookkeeping: failures, blacklisting, incompatibility.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

/// Cool-off after a transient failure (timeout, bad packet, invalid block).
pub const FAILURE_COOLOFF_MS: u64 = 30_000;

/// Cool-off after classifying a peer incompatible (fork beyond the
/// rollback limit).
pub const INCOMPATIBLE_COOLOFF_MS: u64 = 600_000;

/// Identifies a peer for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Clone, Debug, Default)]
struct PeerState {
    failures: u32,
    blacklisted_until_ms: u64,
    incompatible: bool,
}

/// Tracks which peers the synchronizer should currently talk to.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, PeerState>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `peer` may be contacted at `now_ms`.
    pub fn is_usable(&self, peer: PeerId, now_ms: u64) -> bool {
        self.peers
            .lock()
            .get(&peer)
            .map(|state| state.blacklisted_until_ms <= now_ms)
            .unwrap_or(true)
    }

    /// Record a transient failure and blacklist for the short cool-off.
    pub fn report_failure(&self, peer: PeerId, now_ms: u64) {
        let mut peers = self.peers.lock();
        let state = peers.entry(peer).or_default();
        state.failures += 1;
        state.blacklisted_until_ms = now_ms + FAILURE_COOLOFF_MS;
    }

    /// Classify a peer as incompatible and apply the long cool-off.
    pub fn mark_incompatible(&self, peer: PeerId, now_ms: u64) {
        let mut peers = self.peers.lock();
        let state = peers.entry(peer).or_default();
        state.incompatible = true;
        state.blacklisted_until_ms = now_ms + INCOMPATIBLE_COOLOFF_MS;
    }

    pub fn is_incompatible(&self, peer: PeerId) -> bool {
        self.peers
            .lock()
            .get(&peer)
            .map(|state| state.incompatible)
            .unwrap_or(false)
    }

    /// Number of failures recorded against `peer`.
    pub fn failure_count(&self, peer: PeerId) -> u32 {
        self.peers.lock().get(&peer).map(|state| state.failures).unwrap_or(0)
    }
}
