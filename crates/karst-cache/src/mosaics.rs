//! Mosaic (custom asset) entries.

use serde::{Deserialize, Serialize};

use karst_core::types::PublicKey;

/// Definition and current supply of a mosaic.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MosaicEntry {
    /// Account allowed to change the supply.
    pub owner: PublicKey,
    /// Total units in circulation.
    pub supply: u64,
    /// Number of decimal places.
    pub divisibility: u8,
}
