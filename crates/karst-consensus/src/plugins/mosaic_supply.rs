//! Mosaic supply change plugin.
//!
//! Increase mints to the owner, creating the mosaic on first touch;
//! decrease burns and is capped at the current supply. Only the owner may
//! change an existing mosaic's supply.

use karst_cache::{DeltaSet, MosaicEntry, StateRead};
use karst_core::error::{ValidationFailure, ValidationResult};
use karst_core::types::{Hash256, SupplyChangeDirection, Transaction, TransactionBody};

use super::TransactionPlugin;

pub struct MosaicSupplyChangePlugin;

impl TransactionPlugin for MosaicSupplyChangePlugin {
    fn kind(&self) -> &'static str {
        "mosaic_supply_change"
    }

    fn validate_stateless(&self, tx: &Transaction) -> ValidationResult {
        match &tx.body {
            TransactionBody::MosaicSupplyChange { delta: 0, .. } => {
                ValidationResult::Failure(ValidationFailure::ZeroAmount)
            }
            TransactionBody::MosaicSupplyChange { .. } => ValidationResult::Success,
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
        let TransactionBody::MosaicSupplyChange { mosaic_id, direction, delta } = &tx.body else {
            return ValidationResult::Failure(ValidationFailure::UnknownTransactionType);
        };
        match (state.mosaic(*mosaic_id), direction) {
            // First increase defines the mosaic with the signer as owner.
            (None, SupplyChangeDirection::Increase) => ValidationResult::Success,
            (None, SupplyChangeDirection::Decrease) => {
                ValidationResult::Failure(ValidationFailure::MosaicDoesNotExist)
            }
            (Some(entry), _) if entry.owner != tx.signer => {
                ValidationResult::Failure(ValidationFailure::MosaicOwnerMismatch)
            }
            (Some(entry), SupplyChangeDirection::Increase) => {
                if entry.supply.checked_add(*delta).is_none() {
                    ValidationResult::Failure(ValidationFailure::MosaicSupplyExceeded)
                } else {
                    ValidationResult::Success
                }
            }
            (Some(entry), SupplyChangeDirection::Decrease) => {
                if *delta > entry.supply {
                    ValidationResult::Failure(ValidationFailure::MosaicSupplyExceeded)
                } else {
                    ValidationResult::Success
                }
            }
        }
    }

    fn apply(
        &self,
        tx: &Transaction,
        entity_hash: &Hash256,
        state: &mut DeltaSet,
        height: u64,
    ) -> Result<(), ValidationFailure> {
        let TransactionBody::MosaicSupplyChange { mosaic_id, direction, delta } = &tx.body else {
            return Err(ValidationFailure::UnknownTransactionType);
        };
        let (mosaic_id, direction, delta) = (*mosaic_id, *direction, *delta);
        if let ValidationResult::Failure(failure) =
            self.validate_stateful(tx, entity_hash, state, height)
        {
            return Err(failure);
        }

        let mut entry = state
            .mosaic(mosaic_id)
            .unwrap_or(MosaicEntry { owner: tx.signer, supply: 0, divisibility: 0 });
        entry.supply = match direction {
            SupplyChangeDirection::Increase => entry
                .supply
                .checked_add(delta)
                .ok_or(ValidationFailure::MosaicSupplyExceeded)?,
            SupplyChangeDirection::Decrease => entry
                .supply
                .checked_sub(delta)
                .ok_or(ValidationFailure::MosaicSupplyExceeded)?,
        };
        state.set_mosaic(mosaic_id, entry);
        Ok(())
    }
}
