//! Pipeline input ranges and completion reporting.

use karst_core::error::ValidationFailure;

/// Where an input range came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSource {
    /// Produced locally (harvester).
    Local,
    /// Pulled from a peer by the synchronizer.
    RemotePull,
    /// Pushed by a peer.
    RemotePush,
    /// Returned to the pipeline after being rolled back.
    Reverted,
}

/// Why a range was dropped before (or at) the commit stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// A block or transaction failed a validation rule.
    Validation(ValidationFailure),
    /// The range contained nothing new.
    KnownHash,
    /// The range was empty.
    EmptyRange,
    /// The range does not attach to any stored block.
    MissingParent,
    /// Attaching would rewind past the rollback limit.
    RollbackTooDeep,
    /// The range evaluated to a chain no better than the local one.
    StaleScore,
    /// The pipeline is shutting down; the range was drained unprocessed.
    Shutdown,
}

/// Terminal outcome reported for every submitted range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The range was committed (blocks) or admitted (transactions).
    Consumed,
    Aborted(AbortReason),
}

/// Invoked exactly once per submitted range with `(input_id, status)`.
pub type ProcessingCompleteFn = Box<dyn FnOnce(u64, CompletionStatus) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_status_equality() {
        assert_eq!(CompletionStatus::Consumed, CompletionStatus::Consumed);
        assert_ne!(
            CompletionStatus::Consumed,
            CompletionStatus::Aborted(AbortReason::KnownHash),
        );
        assert_eq!(
            CompletionStatus::Aborted(AbortReason::Validation(ValidationFailure::InactiveHash)),
            CompletionStatus::Aborted(AbortReason::Validation(ValidationFailure::InactiveHash)),
        );
    }
}
