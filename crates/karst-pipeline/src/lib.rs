//! # karst-pipeline
//! The staged consumer pipeline: block and transaction ranges flow through
//! filter, transform, and validation stages into a single-writer commit
//! stage that owns the authoritative cache delta.

pub mod commit;
pub mod consumers;
pub mod dispatcher;
pub mod input;

pub use dispatcher::{ConsumerDispatcher, PipelineDeps};
pub use input::{AbortReason, CompletionStatus, InputSource, ProcessingCompleteFn};
