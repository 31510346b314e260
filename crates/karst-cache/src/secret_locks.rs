//! Secret-lock entries: funds released by revealing a preimage.

use serde::{Deserialize, Serialize};

use karst_core::types::PublicKey;

use crate::hash_locks::LockStatus;

/// Funds locked for a recipient until the matching secret is proven.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SecretLockInfo {
    pub owner: PublicKey,
    pub recipient: PublicKey,
    /// Locked amount in microkarst.
    pub amount: u64,
    /// Height at which the lock becomes inactive.
    pub expiration_height: u64,
    pub status: LockStatus,
}

impl SecretLockInfo {
    /// Whether the lock is active at `height` (strictly before expiry).
    pub fn is_active(&self, height: u64) -> bool {
        height < self.expiration_height
    }
}
