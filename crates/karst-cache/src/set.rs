//! The cache set: one committed snapshot, exclusive deltas, detached
//! speculation.
//!
//! Exclusivity of the (non-detached) delta is enforced here with `try_lock`
//! semantics: a second `create_delta` fails with `AlreadyActive` instead of
//! blocking. Views are cheap `Arc` clones of the committed snapshot and may
//! exist in any number, on any thread.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use karst_core::error::CacheError;
use karst_core::types::{Hash256, PublicKey};

use crate::accounts::AccountState;
use crate::delta_map::DeltaMap;
use crate::hash_locks::HashLockInfo;
use crate::mosaics::MosaicEntry;
use crate::namespaces::NamespaceEntry;
use crate::secret_locks::SecretLockInfo;
use crate::snapshot::{cache_root, BlockUndo, StateSnapshot};

/// Read access to the logical state, implemented by committed views and by
/// deltas (which read through their overlay).
pub trait StateRead {
    /// Height of the underlying committed snapshot.
    fn height(&self) -> u64;
    fn account(&self, key: &PublicKey) -> Option<AccountState>;
    fn hash_lock(&self, hash: &Hash256) -> Option<HashLockInfo>;
    fn mosaic(&self, id: u64) -> Option<MosaicEntry>;
    fn namespace(&self, id: u64) -> Option<NamespaceEntry>;
    fn secret_lock(&self, secret: &Hash256) -> Option<SecretLockInfo>;
}

/// The mutable overlay shared by attached and detached deltas.
///
/// Holds an `Arc` of the snapshot it was created over; by construction it
/// never observes commits that happen afterwards.
#[derive(Clone, Debug)]
pub struct DeltaSet {
    base: Arc<StateSnapshot>,
    accounts: DeltaMap<PublicKey, AccountState>,
    hash_locks: DeltaMap<Hash256, HashLockInfo>,
    mosaics: DeltaMap<u64, MosaicEntry>,
    namespaces: DeltaMap<u64, NamespaceEntry>,
    secret_locks: DeltaMap<Hash256, SecretLockInfo>,
}

impl DeltaSet {
    fn over(base: Arc<StateSnapshot>) -> Self {
        Self {
            base,
            accounts: DeltaMap::new(),
            hash_locks: DeltaMap::new(),
            mosaics: DeltaMap::new(),
            namespaces: DeltaMap::new(),
            secret_locks: DeltaMap::new(),
        }
    }

    /// Insert or overwrite an account, keyed by its public key.
    pub fn set_account(&mut self, account: AccountState) {
        self.accounts.insert(&self.base.accounts, account.public_key, account);
    }

    pub fn set_hash_lock(&mut self, hash: Hash256, info: HashLockInfo) {
        self.hash_locks.insert(&self.base.hash_locks, hash, info);
    }

    pub fn remove_hash_lock(&mut self, hash: &Hash256) {
        self.hash_locks.remove(&self.base.hash_locks, hash);
    }

    pub fn set_mosaic(&mut self, id: u64, entry: MosaicEntry) {
        self.mosaics.insert(&self.base.mosaics, id, entry);
    }

    pub fn set_namespace(&mut self, id: u64, entry: NamespaceEntry) {
        self.namespaces.insert(&self.base.namespaces, id, entry);
    }

    pub fn set_secret_lock(&mut self, secret: Hash256, info: SecretLockInfo) {
        self.secret_locks.insert(&self.base.secret_locks, secret, info);
    }

    pub fn remove_secret_lock(&mut self, secret: &Hash256) {
        self.secret_locks.remove(&self.base.secret_locks, secret);
    }

    /// Record an importance snapshot (importance := balance) for every
    /// account at an importance-group height.
    pub fn record_importances(&mut self, height: u64) {
        let accounts: Vec<AccountState> = self
            .accounts
            .union_entries(&self.base.accounts)
            .into_iter()
            .map(|(_, account)| account.clone())
            .collect();
        for mut account in accounts {
            account.record_importance(height, account.balance);
            self.set_account(account);
        }
    }

    /// Undo records restoring the base snapshot from the overlay's result.
    pub fn undo(&self) -> BlockUndo {
        BlockUndo {
            accounts: self.accounts.undo_records(&self.base.accounts),
            hash_locks: self.hash_locks.undo_records(&self.base.hash_locks),
            mosaics: self.mosaics.undo_records(&self.base.mosaics),
            namespaces: self.namespaces.undo_records(&self.base.namespaces),
            secret_locks: self.secret_locks.undo_records(&self.base.secret_locks),
        }
    }

    /// Apply undo records into the overlay, rewinding one block.
    pub fn apply_undo(&mut self, undo: &BlockUndo) {
        for (key, old) in &undo.accounts {
            match old {
                Some(account) => self.accounts.insert(&self.base.accounts, *key, account.clone()),
                None => self.accounts.remove(&self.base.accounts, key),
            }
        }
        for (key, old) in &undo.hash_locks {
            match old {
                Some(info) => self.hash_locks.insert(&self.base.hash_locks, *key, info.clone()),
                None => self.hash_locks.remove(&self.base.hash_locks, key),
            }
        }
        for (key, old) in &undo.mosaics {
            match old {
                Some(entry) => self.mosaics.insert(&self.base.mosaics, *key, entry.clone()),
                None => self.mosaics.remove(&self.base.mosaics, key),
            }
        }
        for (key, old) in &undo.namespaces {
            match old {
                Some(entry) => self.namespaces.insert(&self.base.namespaces, *key, entry.clone()),
                None => self.namespaces.remove(&self.base.namespaces, key),
            }
        }
        for (key, old) in &undo.secret_locks {
            match old {
                Some(info) => self.secret_locks.insert(&self.base.secret_locks, *key, info.clone()),
                None => self.secret_locks.remove(&self.base.secret_locks, key),
            }
        }
    }

    /// Remove every prunable entry whose expiration height is at or below
    /// `boundary`. Recorded as ordinary removals, so the resulting undo
    /// data restores pruned entries on rollback.
    pub fn prune(&mut self, boundary: u64) {
        let expired: Vec<Hash256> = self
            .hash_locks
            .union_entries(&self.base.hash_locks)
            .into_iter()
            .filter(|(_, info)| info.expiration_height <= boundary)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.hash_locks.remove(&self.base.hash_locks, &hash);
        }

        let expired: Vec<Hash256> = self
            .secret_locks
            .union_entries(&self.base.secret_locks)
            .into_iter()
            .filter(|(_, info)| info.expiration_height <= boundary)
            .map(|(secret, _)| *secret)
            .collect();
        for secret in expired {
            self.secret_locks.remove(&self.base.secret_locks, &secret);
        }

        let expired: Vec<u64> = self
            .namespaces
            .union_entries(&self.base.namespaces)
            .into_iter()
            .filter(|(_, entry)| entry.expiration_height <= boundary)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.namespaces.remove(&self.base.namespaces, &id);
        }
    }

    /// Whether the overlay holds no changes.
    pub fn is_unchanged(&self) -> bool {
        self.accounts.is_empty()
            && self.hash_locks.is_empty()
            && self.mosaics.is_empty()
            && self.namespaces.is_empty()
            && self.secret_locks.is_empty()
    }

    /// State hash of the logical union (base plus overlay).
    pub fn state_hash(&self, enabled: bool) -> Hash256 {
        if !enabled {
            return Hash256::ZERO;
        }
        let roots = [
            cache_root(self.accounts.union_entries(&self.base.accounts).into_iter()),
            cache_root(self.hash_locks.union_entries(&self.base.hash_locks).into_iter()),
            cache_root(self.mosaics.union_entries(&self.base.mosaics).into_iter()),
            cache_root(self.namespaces.union_entries(&self.base.namespaces).into_iter()),
            cache_root(self.secret_locks.union_entries(&self.base.secret_locks).into_iter()),
        ];
        karst_core::merkle::merkle_root(&roots)
    }

    /// Materialize the union as a fresh snapshot at `height`.
    fn into_snapshot(&self, height: u64) -> StateSnapshot {
        let mut snapshot = (*self.base).clone();
        self.accounts.apply_to(&mut snapshot.accounts);
        self.hash_locks.apply_to(&mut snapshot.hash_locks);
        self.mosaics.apply_to(&mut snapshot.mosaics);
        self.namespaces.apply_to(&mut snapshot.namespaces);
        self.secret_locks.apply_to(&mut snapshot.secret_locks);
        snapshot.height = height;
        snapshot
    }
}

impl StateRead for DeltaSet {
    fn height(&self) -> u64 {
        self.base.height
    }

    fn account(&self, key: &PublicKey) -> Option<AccountState> {
        self.accounts.get(&self.base.accounts, key).cloned()
    }

    fn hash_lock(&self, hash: &Hash256) -> Option<HashLockInfo> {
        self.hash_locks.get(&self.base.hash_locks, hash).cloned()
    }

    fn mosaic(&self, id: u64) -> Option<MosaicEntry> {
        self.mosaics.get(&self.base.mosaics, &id).cloned()
    }

    fn namespace(&self, id: u64) -> Option<NamespaceEntry> {
        self.namespaces.get(&self.base.namespaces, &id).cloned()
    }

    fn secret_lock(&self, secret: &Hash256) -> Option<SecretLockInfo> {
        self.secret_locks.get(&self.base.secret_locks, secret).cloned()
    }
}

/// Read-only view of the committed state at view-creation time.
pub struct CacheView {
    snapshot: Arc<StateSnapshot>,
    state_hash_enabled: bool,
}

impl CacheView {
    /// State hash of the viewed snapshot.
    pub fn state_hash(&self) -> Hash256 {
        self.snapshot.state_hash(self.state_hash_enabled)
    }

    /// The underlying snapshot.
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }
}

impl StateRead for CacheView {
    fn height(&self) -> u64 {
        self.snapshot.height
    }

    fn account(&self, key: &PublicKey) -> Option<AccountState> {
        self.snapshot.accounts.get(key).cloned()
    }

    fn hash_lock(&self, hash: &Hash256) -> Option<HashLockInfo> {
        self.snapshot.hash_locks.get(hash).cloned()
    }

    fn mosaic(&self, id: u64) -> Option<MosaicEntry> {
        self.snapshot.mosaics.get(&id).cloned()
    }

    fn namespace(&self, id: u64) -> Option<NamespaceEntry> {
        self.snapshot.namespaces.get(&id).cloned()
    }

    fn secret_lock(&self, secret: &Hash256) -> Option<SecretLockInfo> {
        self.snapshot.secret_locks.get(secret).cloned()
    }
}

/// The exclusive mutable delta. Dropping it without committing is the
/// rollback operation.
pub struct CacheDelta<'a> {
    changes: DeltaSet,
    _gate: MutexGuard<'a, ()>,
}

impl std::ops::Deref for CacheDelta<'_> {
    type Target = DeltaSet;
    fn deref(&self) -> &DeltaSet {
        &self.changes
    }
}

impl std::ops::DerefMut for CacheDelta<'_> {
    fn deref_mut(&mut self) -> &mut DeltaSet {
        &mut self.changes
    }
}

/// An owned delta that will never be reconciled with its base.
///
/// Safe to move to another thread; used for speculative harvesting and for
/// evaluating peer chains.
pub struct DetachedDelta {
    changes: DeltaSet,
    state_hash_enabled: bool,
}

impl DetachedDelta {
    /// State hash of the speculative union.
    pub fn state_hash(&self) -> Hash256 {
        self.changes.state_hash(self.state_hash_enabled)
    }
}

impl std::ops::Deref for DetachedDelta {
    type Target = DeltaSet;
    fn deref(&self) -> &DeltaSet {
        &self.changes
    }
}

impl std::ops::DerefMut for DetachedDelta {
    fn deref_mut(&mut self) -> &mut DeltaSet {
        &mut self.changes
    }
}

/// Outcome of a commit.
pub struct CommitOutcome {
    /// State hash of the newly committed snapshot.
    pub state_hash: Hash256,
    /// Undo records for everything the delta changed, pruning included.
    pub undo: BlockUndo,
}

/// All state caches behind one commit gate.
pub struct CacheSet {
    committed: RwLock<Arc<StateSnapshot>>,
    delta_gate: Mutex<()>,
    state_hash_enabled: bool,
}

impl CacheSet {
    /// An empty cache set at height 0.
    pub fn new(state_hash_enabled: bool) -> Self {
        Self {
            committed: RwLock::new(Arc::new(StateSnapshot::default())),
            delta_gate: Mutex::new(()),
            state_hash_enabled,
        }
    }

    /// A cache set seeded with the genesis accounts at height 1.
    pub fn seeded(seed_accounts: &[(PublicKey, u64)], state_hash_enabled: bool) -> Self {
        Self {
            committed: RwLock::new(Arc::new(StateSnapshot::seeded(seed_accounts))),
            delta_gate: Mutex::new(()),
            state_hash_enabled,
        }
    }

    /// Height of the last committed block.
    pub fn height(&self) -> u64 {
        self.committed.read().height
    }

    /// State hash of the committed snapshot.
    pub fn state_hash(&self) -> Hash256 {
        self.committed.read().state_hash(self.state_hash_enabled)
    }

    pub fn state_hash_enabled(&self) -> bool {
        self.state_hash_enabled
    }

    /// A read-only view pinned to the current committed snapshot.
    pub fn create_view(&self) -> CacheView {
        CacheView {
            snapshot: Arc::clone(&self.committed.read()),
            state_hash_enabled: self.state_hash_enabled,
        }
    }

    /// The exclusive delta. Fails with [`CacheError::AlreadyActive`] if
    /// another delta is live; never blocks.
    pub fn create_delta(&self) -> Result<CacheDelta<'_>, CacheError> {
        let gate = self.delta_gate.try_lock().ok_or(CacheError::AlreadyActive)?;
        let base = Arc::clone(&self.committed.read());
        Ok(CacheDelta { changes: DeltaSet::over(base), _gate: gate })
    }

    /// An independent delta over the current snapshot. Unlimited in number;
    /// never committed back.
    pub fn create_detached_delta(&self) -> DetachedDelta {
        let base = Arc::clone(&self.committed.read());
        DetachedDelta {
            changes: DeltaSet::over(base),
            state_hash_enabled: self.state_hash_enabled,
        }
    }

    /// Commit a delta as the next block's state, advancing the height by
    /// one and pruning expired entries at or below `boundary` first.
    pub fn commit(
        &self,
        mut delta: CacheDelta<'_>,
        boundary: Option<u64>,
    ) -> Result<CommitOutcome, CacheError> {
        if let Some(boundary) = boundary {
            delta.changes.prune(boundary);
        }
        let height = delta.changes.base.height + 1;
        self.install(delta, height)
    }

    /// Commit a rewound delta during reorganization. The height must be
    /// strictly below the current committed height; nothing is pruned.
    pub fn commit_rewound(
        &self,
        delta: CacheDelta<'_>,
        height: u64,
    ) -> Result<CommitOutcome, CacheError> {
        let current = delta.changes.base.height;
        if height >= current {
            return Err(CacheError::CommitHeightMismatch { expected: current, got: height });
        }
        self.install(delta, height)
    }

    fn install(&self, delta: CacheDelta<'_>, height: u64) -> Result<CommitOutcome, CacheError> {
        let undo = delta.changes.undo();
        let snapshot = delta.changes.into_snapshot(height);
        let state_hash = snapshot.state_hash(self.state_hash_enabled);
        *self.committed.write() = Arc::new(snapshot);
        Ok(CommitOutcome { state_hash, undo })
    }
}
