//! Namespace registration plugin.

use karst_cache::{DeltaSet, NamespaceEntry, StateRead};
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Hash256, Transaction, TransactionBody};

use super::TransactionPlugin;

pub struct RegisterNamespacePlugin;

impl TransactionPlugin for RegisterNamespacePlugin {
    fn kind(&self) -> &'static str {
        "register_namespace"
    }

    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match &tx.body {
            TransactionBody::RegisterNamespace { duration: 0, .. } => {
                ValidationResult::Failure(ValidationFailure::ZeroAmount)
            }
            TransactionBody::RegisterNamespace { .. } => ValidationResult::Success,
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
        let TransactionBody::RegisterNamespace { namespace_id, .. } = &tx.body else {
            return ValidationResult::Failure(ValidationFailure::UnknownTransactionType);
        };
        // An expired registration may be claimed by anyone.
        match state.namespace(*namespace_id) {
            Some(entry) if entry.is_active(height) => {
                ValidationResult::Failure(ValidationFailure::NamespaceAlreadyExists)
            }
            _ => ValidationResult::Success,
        }
    }

    fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure> {
        let TransactionBody::RegisterNamespace { namespace_id, duration } = &tx.body else {
            return Err(ValidationFailure::UnknownTransactionType);
        };
        let (namespace_id, duration) = (*namespace_id, *duration);
        if let ValidationResult::Failure(failure) =
            self.validate_stateful(tx, entity_hash, state, height)
        {
            return Err(failure);
        }
        state.set_namespace(
            namespace_id,
            NamespaceEntry { owner: tx.signer, expiration_height: height + duration },
        );
        Ok(())
    }
}
