//! Hash-lock and bonded-aggregate plugins.
//!
//! A `HashLock` posts a deposit against the entity hash of a future bonded
//! aggregate. The aggregate is accepted only while a matching lock is
//! active and unused; acceptance flips the lock to `Used` and refunds the
//! deposit to the lock owner.

use karst_cache::{DeltaSet, HashLockInfo, LockStatus, StateRead};
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Hash256, Transaction, TransactionBody};

use super::{check_balance, credit, debit, TransactionPlugin};

pub struct HashLockPlugin;

impl TransactionPlugin for HashLockPlugin {
    fn kind(&self) -> &'static str {
        "hash_lock"
    }

    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match &tx.body {
            TransactionBody::HashLock { amount: 0, .. }
            | TransactionBody::HashLock { duration: 0, .. } => {
                ValidationResult::Failure(ValidationFailure::ZeroAmount)
            }
            TransactionBody::HashLock { .. } => ValidationResult::Success,
            _ => ValidationResult::Failure(ValidationFailure::UnknownTransactionType),
        }
    }

    fn validate_stateful(
        &self,
        tx: &Transaction,
        _entity_hash: &Hash256,
        state: &dyn StateRead,
        _height: u64,
    ) -> ValidationResult {
        let TransactionBody::HashLock { lock_hash, amount, .. } = &tx.body else {
            return ValidationResult::Failure(ValidationFailure::UnknownTransactionType);
        };
        if state.hash_lock(lock_hash).is_some() {
            return ValidationResult::Failure(ValidationFailure::DuplicateEntity);
        }
        check_balance(state, &tx.signer, *amount)
    }

    fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure> {
        let TransactionBody::HashLock { lock_hash, amount, duration } = &tx.body else {
            return Err(ValidationFailure::UnknownTransactionType);
        };
        let (lock_hash, amount, duration) = (*lock_hash, *amount, *duration);
        if let ValidationResult::Failure(failure) =
            self.validate_stateful(tx, entity_hash, state, height)
        {
            return Err(failure);
        }
        debit(state, &tx.signer, amount)?;
        state.set_hash_lock(
            lock_hash,
            HashLockInfo {
                owner: tx.signer,
                amount,
                expiration_height: height + duration,
                status: LockStatus::Unused,
            },
        );
        Ok(())
    }
}

pub struct AggregateBondedPlugin;

impl AggregateBondedPlugin {
    /// The lock-presence grid: exists, then active, then unused.
    fn check_lock(lock: Option<HashLockInfo>, height: u64) -> ValidationResult {
        let Some(lock) = lock else {
            return ValidationResult::Failure(ValidationFailure::HashDoesNotExist);
        };
        if !lock.is_active(height) {
            return ValidationResult::Failure(ValidationFailure::InactiveHash);
        }
        if lock.status == LockStatus::Used {
            return ValidationResult::Failure(ValidationFailure::HashAlreadyUsed);
        }
        ValidationResult::Success
    }
}

impl TransactionPlugin for AggregateBondedPlugin {
    fn kind(&self) -> &'static str {
        "aggregate_bonded"
    }

    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match &tx.body {
            TransactionBody::AggregateBonded { transfers } if transfers.is_empty() => {
                ValidationResult::Failure(ValidationFailure::ZeroAmount)
            }
            TransactionBody::AggregateBonded { transfers }
                if transfers.iter().any(|(_, amount)| *amount == 0) =>
            {
                ValidationResult::Failure(ValidationFailure::ZeroAmount)
            }
            TransactionBody::AggregateBonded { .. } => ValidationResult::Success,
            _ => ValidationResult::Failure(ValidationFailure::UnknownTransactionType),
        }
    }

    fn validate_stateful(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &dyn StateRead,
        height: u64,
    ) -> ValidationResult {
        let TransactionBody::AggregateBonded { transfers } = &tx.body else {
            return ValidationResult::Failure(ValidationFailure::UnknownTransactionType);
        };
        let result = Self::check_lock(state.hash_lock(entity_hash), height);
        if !result.is_success() {
            return result;
        }
        let total: u64 = transfers.iter().map(|(_, amount)| *amount).sum();
        check_balance(state, &tx.signer, total)
    }

    fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure> {
        let TransactionBody::AggregateBonded { transfers } = tx.body.clone() else {
            return Err(ValidationFailure::UnknownTransactionType);
        };
        if let ValidationResult::Failure(failure) =
            self.validate_stateful(tx, entity_hash, state, height)
        {
            return Err(failure);
        }

        // Consume the lock and refund the deposit to its owner.
        let mut lock = state
            .hash_lock(entity_hash)
            .ok_or(ValidationFailure::HashDoesNotExist)?;
        lock.status = LockStatus::Used;
        let (owner, deposit) = (lock.owner, lock.amount);
        state.set_hash_lock(*entity_hash, lock);
        credit(state, &owner, deposit)?;

        for (recipient, amount) in transfers {
            debit(state, &tx.signer, amount)?;
            credit(state, &recipient, amount)?;
        }
        Ok(())
    }
}
