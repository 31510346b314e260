//! The transaction-plugin registry.
//!
//! Each declarative transaction body has exactly one plugin. A plugin
//! validates statelessly (structure only), statefully (against a read-only
//! state view), and applies the transition to a delta. `apply` re-runs the
//! stateful checks against the delta so that ordering effects inside a
//! block are respected, and performs no mutation unless every check
//! passes.

use std::collections::HashMap;
use std::sync::Arc;

use karst_cache::{AccountState, DeltaSet, StateRead};
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Hash256, PublicKey, Transaction};

pub mod hash_lock;
pub mod mosaic_supply;
pub mod namespace;
pub mod secret_lock;
pub mod transfer;

/// A validator/observer pair for one transaction body kind.
pub trait TransactionPlugin: Send + Sync {
    /// The body kind this plugin handles; must match
    /// [`TransactionBody::kind`](karst_core::types::TransactionBody::kind).
    fn kind(&self) -> &'static str;

    /// Structure-only checks; no state access.
    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult;

    /// Checks against a state view at `height`.
    fn validate_stateful(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &dyn StateRead,
        height: u64,
    ) -> ValidationResult;

    /// Apply the transition to `state`. Must not mutate on failure.
    fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure>;
}

/// Registry dispatching transactions to their plugins by body kind.
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn TransactionPlugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { plugins: HashMap::new() }
    }

    /// A registry with every built-in plugin registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(transfer::TransferPlugin));
        registry.register(Arc::new(hash_lock::HashLockPlugin));
        registry.register(Arc::new(hash_lock::AggregateBondedPlugin));
        registry.register(Arc::new(mosaic_supply::MosaicSupplyChangePlugin));
        registry.register(Arc::new(namespace::RegisterNamespacePlugin));
        registry.register(Arc::new(secret_lock::SecretLockPlugin));
        registry.register(Arc::new(secret_lock::SecretProofPlugin));
        registry
    }

    /// Register a plugin, replacing any existing one for the same kind.
    pub fn register(&mut self, plugin: Arc<dyn TransactionPlugin>) {
        self.plugins.insert(plugin.kind(), plugin);
    }

    fn plugin_for(&self, tx: &Transaction) -> Result<&Arc<dyn TransactionPlugin>, ValidationFailure> {
        self.plugins
            .get(tx.body.kind())
            .ok_or(ValidationFailure::UnknownTransactionType)
    }

    /// Dispatch stateless validation.
    pub fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match self.plugin_for(tx) {
            Ok(plugin) => plugin.validate_stateless(tx),
            Err(failure) => ValidationResult::Failure(failure),
        }
    }

    /// Dispatch stateful validation.
    pub fn validate_stateful(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &dyn StateRead,
        height: u64,
    ) -> ValidationResult {
        match self.plugin_for(tx) {
            Ok(plugin) => plugin.validate_stateful(tx, entity_hash, state, height),
            Err(failure) => ValidationResult::Failure(failure),
        }
    }

    /// Dispatch application.
    pub fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure> {
        self.plugin_for(tx)?.apply(tx, entity_hash, state, height)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// --- Shared balance helpers ---

/// Check that `key`'s account exists and holds at least `amount`.
pub(crate) fn check_balance(
    state: &dyn StateRead,
    key: &PublicKey,
    amount: u64,
) -> ValidationResult {
    match state.account(key) {
        None => ValidationResult::Failure(ValidationFailure::UnknownAccount),
        Some(account) if account.balance < amount => {
            ValidationResult::Failure(ValidationFailure::InsufficientBalance)
        }
        Some(_) => ValidationResult::Success,
    }
}

/// Debit `amount` from `key`. Fails without mutating when the account is
/// missing or underfunded.
pub(crate) fn debit(
    state: &mut DeltaSet,
    key: &PublicKey,
    amount: u64,
) -> Result<(), ValidationFailure> {
    let mut account = state.account(key).ok_or(ValidationFailure::UnknownAccount)?;
    account.balance = account
        .balance
        .checked_sub(amount)
        .ok_or(ValidationFailure::InsufficientBalance)?;
    state.set_account(account);
    Ok(())
}

/// Credit `amount` to `key`, creating the account on first touch.
pub(crate) fn credit(
    state: &mut DeltaSet,
    key: &PublicKey,
    amount: u64,
) -> Result<(), ValidationFailure> {
    let mut account = state
        .account(key)
        .unwrap_or_else(|| AccountState::new(*key, 0));
    account.balance = account
        .balance
        .checked_add(amount)
        .ok_or(ValidationFailure::AmountOverflow)?;
    state.set_account(account);
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use karst_cache::CacheSet;
    use karst_core::types::{PublicKey, Transaction, TransactionBody};

    /// A cache set with two funded accounts (0x01 and 0x02).
    pub fn seeded_caches() -> CacheSet {
        CacheSet::seeded(
            &[(PublicKey([0x01; 32]), 1_000_000), (PublicKey([0x02; 32]), 2_000_000)],
            true,
        )
    }

    /// An unsigned transaction with the given signer seed and body.
    pub fn tx(signer_seed: u8, body: TransactionBody) -> Transaction {
        Transaction {
            signer: PublicKey([signer_seed; 32]),
            deadline: 1_000_000,
            max_fee: 0,
            body,
            signature: vec![0u8; 64],
        }
    }
}
