//! Row types for the engine's tables.
//!
//! Rows decode straight from SQL via `FromRow`; `into_domain` converts them
//! into the `genbatch_core` types the pipeline works with.

pub mod batch;
pub mod item;
pub mod result_asset;

/// Build a decode error for a status id that has no enum variant.
pub(crate) fn unknown_status(table: &str, id: i16) -> sqlx::Error {
    sqlx::Error::Decode(format!("unknown {table} status_id {id}").into())
}
