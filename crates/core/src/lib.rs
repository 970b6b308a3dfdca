//! Domain types and pure logic for the batch generation engine.
//!
//! This crate has no internal dependencies so it can be shared by the
//! database layer, the execution pipeline, the provider client, and any
//! future CLI tooling.

pub mod batch;
pub mod credentials;
pub mod error;
pub mod generation;
pub mod hashing;
pub mod retry;
pub mod status;
pub mod types;
