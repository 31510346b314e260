//! Secret-lock and secret-proof plugins.
//!
//! A secret lock escrows funds for a recipient; revealing the BLAKE3
//! preimage of the secret releases them. The same exists/active/used grid
//! as hash locks applies.

use karst_cache::{DeltaSet, LockStatus, SecretLockInfo, StateRead};
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Hash256, Transaction, TransactionBody};

use super::{check_balance, credit, debit, TransactionPlugin};

pub struct SecretLockPlugin;

impl TransactionPlugin for SecretLockPlugin {
    fn kind(&self) -> &'static str {
        "secret_lock"
    }

    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match &tx.body {
            TransactionBody::SecretLock { amount: 0, .. }
            | TransactionBody::SecretLock { duration: 0, .. } => {
                ValidationResult::Failure(ValidationFailure::ZeroAmount)
            }
            TransactionBody::SecretLock { .. } => ValidationResult::Success,
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
        let TransactionBody::SecretLock { secret, amount, .. } = &tx.body else {
            return ValidationResult::Failure(ValidationFailure::UnknownTransactionType);
        };
        if state.secret_lock(secret).is_some() {
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
        let TransactionBody::SecretLock { secret, recipient, amount, duration } = &tx.body else {
            return Err(ValidationFailure::UnknownTransactionType);
        };
        let (secret, recipient, amount, duration) = (*secret, *recipient, *amount, *duration);
        if let ValidationResult::Failure(failure) =
            self.validate_stateful(tx, entity_hash, state, height)
        {
            return Err(failure);
        }
        debit(state, &tx.signer, amount)?;
        state.set_secret_lock(
            secret,
            SecretLockInfo {
                owner: tx.signer,
                recipient,
                amount,
                expiration_height: height + duration,
                status: LockStatus::Unused,
            },
        );
        Ok(())
    }
}

pub struct SecretProofPlugin;

impl TransactionPlugin for SecretProofPlugin {
    fn kind(&self) -> &'static str {
        "secret_proof"
    }

    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match &tx.body {
            TransactionBody::SecretProof { .. } => ValidationResult::Success,
            _ => ValidationResult::Failure(ValidationFailure::UnknownTransactionType),
        }
    }

    fn validate_stateful(
        &self,
        tx: &Transaction,
        _entity_hash: &Hash256,
        state: &dyn StateRead,
        height: u64,
    ) -> ValidationResult {
        let TransactionBody::SecretProof { secret, proof } = &tx.body else {
            return ValidationResult::Failure(ValidationFailure::UnknownTransactionType);
        };
        let Some(lock) = state.secret_lock(secret) else {
            return ValidationResult::Failure(ValidationFailure::SecretDoesNotExist);
        };
        if !lock.is_active(height) {
            return ValidationResult::Failure(ValidationFailure::InactiveSecret);
        }
        if lock.status == LockStatus::Used {
            return ValidationResult::Failure(ValidationFailure::SecretAlreadyUsed);
        }
        if Hash256(blake3::hash(proof).into()) != *secret {
            return ValidationResult::Failure(ValidationFailure::SecretProofMismatch);
        }
        ValidationResult::Success
    }

    fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure> {
        let TransactionBody::SecretProof { secret, .. } = tx.body.clone() else {
            return Err(ValidationFailure::UnknownTransactionType);
        };
        if let ValidationResult::Failure(failure) =
            self.validate_stateful(tx, entity_hash, state, height)
        {
            return Err(failure);
        }
        let mut lock = state
            .secret_lock(&secret)
            .ok_or(ValidationFailure::SecretDoesNotExist)?;
        lock.status = LockStatus::Used;
        let (recipient, amount) = (lock.recipient, lock.amount);
        state.set_secret_lock(secret, lock);
        credit(state, &recipient, amount)
    }
}
