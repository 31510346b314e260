//! Account state: balances and importance snapshots.

use serde::{Deserialize, Serialize};

use karst_core::types::PublicKey;

/// How many importance snapshots an account retains.
///
/// One rollback can undo at most one importance recomputation, so two
/// historical snapshots plus the current one always suffice.
pub const MAX_IMPORTANCE_SNAPSHOTS: usize = 3;

/// An importance value recorded at an importance-group height.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ImportanceSnapshot {
    pub height: u64,
    pub importance: u64,
}

/// State of a single account.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct AccountState {
    pub public_key: PublicKey,
    /// Spendable balance in microkarst.
    pub balance: u64,
    /// Importance snapshots, most recent first.
    pub importances: Vec<ImportanceSnapshot>,
}

impl AccountState {
    /// A fresh account with the given balance and no importance yet.
    pub fn new(public_key: PublicKey, balance: u64) -> Self {
        Self { public_key, balance, importances: Vec::new() }
    }

    /// Record an importance snapshot at `height`, displacing the oldest
    /// snapshot beyond [`MAX_IMPORTANCE_SNAPSHOTS`]. Re-recording at the
    /// same height overwrites in place.
    pub fn record_importance(&mut self, height: u64, importance: u64) {
        if let Some(first) = self.importances.first_mut() {
            if first.height == height {
                first.importance = importance;
                return;
            }
        }
        self.importances.insert(0, ImportanceSnapshot { height, importance });
        self.importances.truncate(MAX_IMPORTANCE_SNAPSHOTS);
    }

    /// The importance effective at `height`: the most recent snapshot whose
    /// height does not exceed it. Zero if none qualifies.
    pub fn importance_at(&self, height: u64) -> u64 {
        self.importances
            .iter()
            .find(|s| s.height <= height)
            .map(|s| s.importance)
            .unwrap_or(0)
    }

    /// Drop snapshots recorded above `height`. Used during rollback.
    pub fn prune_importances_above(&mut self, height: u64) {
        self.importances.retain(|s| s.height <= height);
    }
}
