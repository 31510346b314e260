//! Hash-lock entries backing bonded aggregates.

use serde::{Deserialize, Serialize};

use karst_core::types::PublicKey;

/// Whether a lock has been consumed.
///
/// The only legal transition is `Unused` to `Used`.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum LockStatus {
    Unused,
    Used,
}

/// A deposit locked against a future aggregate transaction hash.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct HashLockInfo {
    /// Account that posted the lock deposit.
    pub owner: PublicKey,
    /// Deposit amount in microkarst.
    pub amount: u64,
    /// Height at which the lock becomes inactive. A lock is usable only at
    /// notification heights strictly below this value.
    pub expiration_height: u64,
    pub status: LockStatus,
}

impl HashLockInfo {
    /// Whether the lock is active at `height` (strictly before expiry).
    pub fn is_active(&self, height: u64) -> bool {
        height < self.expiration_height
    }
}
