//! Consensus-critical chain configuration.

use serde::Deserialize;

use crate::error::KarstError;

/// Chain parameters shared by every node on a network.
///
/// `max_difficulty_blocks` must equal `max_rollback_blocks - 1`, and
/// `max_rollback_blocks` must stay below `importance_grouping * 2` so that
/// a rollback never crosses more than one importance recomputation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Interval (in blocks) at which account importances are recomputed.
    pub importance_grouping: u64,
    /// Deepest fork the node will reorganize across.
    pub max_rollback_blocks: u64,
    /// Window of recent blocks feeding the difficulty calculation.
    pub max_difficulty_blocks: u64,
    /// Target spacing between blocks, in milliseconds.
    pub block_time_interval_ms: u64,
    /// Upper bound on transactions gathered into a harvested block.
    pub max_transactions_per_block: usize,
    /// When false, every state hash reports zero and commit-time state-hash
    /// verification is skipped. Used by light configurations and tests.
    pub state_hash_enabled: bool,
}

impl ChainConfig {
    /// Validate the cross-field constraints.
    pub fn validate(&self) -> Result<(), KarstError> {
        if self.importance_grouping == 0 {
            return Err(KarstError::Config("importance_grouping must be nonzero".into()));
        }
        if self.max_rollback_blocks == 0 {
            return Err(KarstError::Config("max_rollback_blocks must be nonzero".into()));
        }
        if self.max_difficulty_blocks != self.max_rollback_blocks - 1 {
            return Err(KarstError::Config(format!(
                "max_difficulty_blocks must be max_rollback_blocks - 1 (got {} and {})",
                self.max_difficulty_blocks, self.max_rollback_blocks,
            )));
        }
        if self.max_rollback_blocks >= self.importance_grouping * 2 {
            return Err(KarstError::Config(format!(
                "max_rollback_blocks ({}) must be below importance_grouping * 2 ({})",
                self.max_rollback_blocks,
                self.importance_grouping * 2,
            )));
        }
        if self.block_time_interval_ms == 0 {
            return Err(KarstError::Config("block_time_interval_ms must be nonzero".into()));
        }
        Ok(())
    }

    /// The most recent importance-group height at or below `height`.
    ///
    /// Height 1 (genesis) is always a group height.
    pub fn importance_group_height(&self, height: u64) -> u64 {
        if height <= 1 || self.importance_grouping == 0 {
            return 1;
        }
        let grouped = height - height % self.importance_grouping;
        grouped.max(1)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            importance_grouping: 63,
            max_rollback_blocks: 124,
            max_difficulty_blocks: 123,
            block_time_interval_ms: 15_000,
            max_transactions_per_block: 200,
            state_hash_enabled: true,
        }
    }
}
