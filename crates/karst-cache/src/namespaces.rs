//! Namespace registrations.

use serde::{Deserialize, Serialize};

use karst_core::types::PublicKey;

/// A claimed namespace with its expiry.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct NamespaceEntry {
    pub owner: PublicKey,
    /// Height at which the registration lapses.
    pub expiration_height: u64,
}

impl NamespaceEntry {
    /// Whether the registration is live at `height`.
    pub fn is_active(&self, height: u64) -> bool {
        height < self.expiration_height
    }
}
