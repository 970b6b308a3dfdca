//! Runtime wiring for the batch worker binary.

pub mod config;
