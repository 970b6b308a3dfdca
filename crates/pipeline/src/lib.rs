//! Batch execution pipeline: work queue, worker pool, progress tracking,
//! result storage, and the coordinator that ties them together.
//!
//! Components talk through the [`queue::JobQueue`], [`store::BatchStore`]
//! and [`results::ResultStore`] traits. In-memory implementations live in
//! [`memory`] and [`results`]; Postgres ones in [`postgres`] and
//! [`results::FsResultStore`].

pub mod context;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod progress;
pub mod queue;
pub mod reclaimer;
pub mod results;
pub mod store;
pub mod worker_pool;

pub use context::PipelineContext;
pub use coordinator::{BatchCoordinator, CoordinatorConfig, SubmitBatch};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
