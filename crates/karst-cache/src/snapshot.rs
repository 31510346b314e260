//! The committed state snapshot and its hash commitments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use karst_core::merkle;
use karst_core::types::{Hash256, PublicKey};

use crate::accounts::AccountState;
use crate::hash_locks::HashLockInfo;
use crate::mosaics::MosaicEntry;
use crate::namespaces::NamespaceEntry;
use crate::secret_locks::SecretLockInfo;

/// An immutable snapshot of every state cache at a committed height.
///
/// Commits produce a fresh snapshot and swap it in behind an `Arc`, so any
/// reader still holding the previous snapshot keeps a consistent view.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Height of the last committed block reflected in this snapshot.
    pub height: u64,
    pub accounts: BTreeMap<PublicKey, AccountState>,
    pub hash_locks: BTreeMap<Hash256, HashLockInfo>,
    pub mosaics: BTreeMap<u64, MosaicEntry>,
    pub namespaces: BTreeMap<u64, NamespaceEntry>,
    pub secret_locks: BTreeMap<Hash256, SecretLockInfo>,
}

impl StateSnapshot {
    /// The genesis snapshot: seed accounts funded and given their initial
    /// importance, height 1.
    pub fn seeded(seed_accounts: &[(PublicKey, u64)]) -> Self {
        let mut accounts = BTreeMap::new();
        for (key, balance) in seed_accounts {
            let mut account = AccountState::new(*key, *balance);
            account.record_importance(1, *balance);
            accounts.insert(*key, account);
        }
        Self { height: 1, accounts, ..Self::default() }
    }

    /// The global state hash: a merkle root over the per-cache roots in
    /// fixed cache-name order. Zero when state hashing is disabled.
    pub fn state_hash(&self, enabled: bool) -> Hash256 {
        if !enabled {
            return Hash256::ZERO;
        }
        let roots = [
            cache_root(self.accounts.iter()),
            cache_root(self.hash_locks.iter()),
            cache_root(self.mosaics.iter()),
            cache_root(self.namespaces.iter()),
            cache_root(self.secret_locks.iter()),
        ];
        merkle::merkle_root(&roots)
    }
}

/// Merkle root over a cache's entries, iterated in ascending key order.
///
/// Each leaf commits to the canonical encoding of one `(key, value)` pair.
pub(crate) fn cache_root<'a, K, V, I>(entries: I) -> Hash256
where
    K: bincode::Encode + 'a,
    V: bincode::Encode + 'a,
    I: Iterator<Item = (&'a K, &'a V)>,
{
    let config = bincode::config::standard();
    let leaves: Vec<Hash256> = entries
        .map(|(key, value)| {
            let mut bytes = bincode::encode_to_vec(key, config)
                .expect("fixed-layout cache keys always encode");
            bytes.extend(
                bincode::encode_to_vec(value, config)
                    .expect("fixed-layout cache values always encode"),
            );
            Hash256(blake3::hash(&bytes).into())
        })
        .collect();
    merkle::merkle_root(&leaves)
}

/// Per-block undo data: the pre-image of every cache entry a block's
/// execution touched. Applying the records over the post-block state
/// restores the pre-block state bit for bit.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockUndo {
    pub accounts: Vec<(PublicKey, Option<AccountState>)>,
    pub hash_locks: Vec<(Hash256, Option<HashLockInfo>)>,
    pub mosaics: Vec<(u64, Option<MosaicEntry>)>,
    pub namespaces: Vec<(u64, Option<NamespaceEntry>)>,
    pub secret_locks: Vec<(Hash256, Option<SecretLockInfo>)>,
}

impl BlockUndo {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.hash_locks.is_empty()
            && self.mosaics.is_empty()
            && self.namespaces.is_empty()
            && self.secret_locks.is_empty()
    }
}
