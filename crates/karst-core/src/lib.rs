//! # karst-core
//! Foundation types and traits for the Karst protocol.

pub mod chain_config;
pub mod clock;
pub mod crypto;
pub mod element;
pub mod error;
pub mod genesis;
pub mod merkle;
pub mod types;
pub mod ut_cache;
