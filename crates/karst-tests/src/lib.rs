//! Shared helpers for end-to-end and multi-node tests.

pub mod helpers;
