//! The transfer plugin: move balance between accounts.

use karst_cache::{DeltaSet, StateRead};
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Hash256, Transaction, TransactionBody};

use super::{check_balance, credit, debit, TransactionPlugin};

pub struct TransferPlugin;

impl TransactionPlugin for TransferPlugin {
    fn kind(&self) -> &'static str {
        "transfer"
    }

    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match &tx.body {
            TransactionBody::Transfer { amount: 0, .. } => {
                ValidationResult::Failure(ValidationFailure::ZeroAmount)
            }
            TransactionBody::Transfer { .. } => ValidationResult::Success,
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
        let TransactionBody::Transfer { amount, .. } = &tx.body else {
            return ValidationResult::Failure(ValidationFailure::UnknownTransactionType);
        };
        check_balance(state, &tx.signer, *amount)
    }

    fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure> {
        let TransactionBody::Transfer { recipient, amount } = &tx.body else {
            return Err(ValidationFailure::UnknownTransactionType);
        };
        let (recipient, amount) = (*recipient, *amount);
        if let ValidationResult::Failure(failure) =
            self.validate_stateful(tx, entity_hash, state, height)
        {
            return Err(failure);
        }
        debit(state, &tx.signer, amount)?;
        credit(state, &recipient, amount)
    }
}
