//! Core abstractions for Voxmeter: normalized metrics types and usage-ledger contracts.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod ledger;
pub mod metrics;
