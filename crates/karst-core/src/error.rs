//! Error types for the Karst protocol.
use thiserror::Error;

use crate::types::Hash256;

/// Outcome of validating a single entity.
///
/// `Neutral` means the entity cannot be decided yet (e.g. a dependency is
/// missing); callers may retry it later without penalizing the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Success,
    Neutral,
    Failure(ValidationFailure),
}

impl ValidationResult {
    /// Whether the entity passed validation.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Specific validation failure codes surfaced to submitters.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("signature invalid")] SignatureInvalid,
    #[error("deadline passed")] DeadlinePassed,
    #[error("unknown account")] UnknownAccount,
    #[error("insufficient balance")] InsufficientBalance,
    #[error("hash does not exist")] HashDoesNotExist,
    #[error("inactive hash")] InactiveHash,
    #[error("hash already used")] HashAlreadyUsed,
    #[error("secret does not exist")] SecretDoesNotExist,
    #[error("inactive secret")] InactiveSecret,
    #[error("secret already used")] SecretAlreadyUsed,
    #[error("secret proof mismatch")] SecretProofMismatch,
    #[error("mosaic does not exist")] MosaicDoesNotExist,
    #[error("mosaic owner mismatch")] MosaicOwnerMismatch,
    #[error("mosaic supply exceeded")] MosaicSupplyExceeded,
    #[error("namespace already exists")] NamespaceAlreadyExists,
    #[error("amount overflow")] AmountOverflow,
    #[error("zero amount")] ZeroAmount,
    #[error("previous hash mismatch")] PreviousHashMismatch,
    #[error("height mismatch")] HeightMismatch,
    #[error("timestamp not after parent")] TimestampNotAfterParent,
    #[error("difficulty mismatch")] DifficultyMismatch,
    #[error("transactions hash mismatch")] TransactionsHashMismatch,
    #[error("state hash mismatch")] StateHashMismatch,
    #[error("duplicate entity")] DuplicateEntity,
    #[error("unknown transaction type")] UnknownTransactionType,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("a delta is already active on this cache set")] AlreadyActive,
    #[error("no delta to commit or roll back")] NoActiveDelta,
    #[error("commit height mismatch: expected {expected}, got {got}")]
    CommitHeightMismatch { expected: u64, got: u64 },
    #[error("undo data references unknown height {0}")] UnknownUndoHeight(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("block not found at height {0}")] BlockNotFound(u64),
    #[error("undo data missing at height {0}")] UndoDataMissing(u64),
    #[error("non-contiguous save: expected height {expected}, got {got}")]
    NonContiguousSave { expected: u64, got: u64 },
    #[error("io: {0}")] Io(String),
}

/// Wiring errors in the server hook surface. Always a programmer error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("hook '{0}' is already set")] AlreadySet(&'static str),
    #[error("hook '{0}' read before set")] NotSet(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("request timed out")] Timeout,
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error("malformed packet: {0}")] MalformedPacket(String),
    #[error("peer chain does not link to ours")] ChainBroken,
    #[error("common ancestor beyond rollback limit (ancestor {ancestor}, local {local})")]
    RollbackTooDeep { ancestor: u64, local: u64 },
    #[error("peer chain scored below claim")] ScoreRegression,
    #[error("peer block failed validation: {0}")] InvalidBlock(ValidationFailure),
    #[error("local storage: {0}")] LocalStorage(String),
}

impl SyncError {
    /// Whether this error marks the peer incompatible (fork beyond the
    /// rollback limit) rather than merely misbehaving or unreachable.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::RollbackTooDeep { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtCacheError {
    #[error("transaction already in cache: {0}")] AlreadyExists(Hash256),
    #[error("cache full")] CacheFull,
}

#[derive(Error, Debug)]
pub enum KarstError {
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Cache(#[from] CacheError),
    #[error(transparent)] Storage(#[from] StorageError),
    #[error(transparent)] Hook(#[from] HookError),
    #[error(transparent)] Sync(#[from] SyncError),
    #[error(transparent)] UtCache(#[from] UtCacheError),
    #[error("validation: {0}")] Validation(ValidationFailure),
    #[error("config: {0}")] Config(String),
    #[error("fatal: {0}")] Fatal(String),
}
