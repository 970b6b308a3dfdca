//! Shared handles to the engine's components.

use std::sync::Arc;

use genbatch_core::credentials::CredentialVault;

use crate::memory::{MemoryBatchStore, MemoryQueue};
use crate::progress::ProgressTracker;
use crate::queue::JobQueue;
use crate::results::{MemoryResultStore, ResultStore};
use crate::store::BatchStore;

/// Everything the coordinator, the worker pool, and the reclaimer share.
/// Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn BatchStore>,
    pub results: Arc<dyn ResultStore>,
    pub tracker: Arc<ProgressTracker>,
    pub vault: Arc<CredentialVault>,
}

impl PipelineContext {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn BatchStore>,
        results: Arc<dyn ResultStore>,
        vault: CredentialVault,
    ) -> Self {
        let tracker = Arc::new(ProgressTracker::new(Arc::clone(&store)));
        Self {
            queue,
            store,
            results,
            tracker,
            vault: Arc::new(vault),
        }
    }

    /// A context backed entirely by in-process state.
    pub fn in_memory(vault: CredentialVault) -> Self {
        Self::new(
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryBatchStore::new()),
            Arc::new(MemoryResultStore::new()),
            vault,
        )
    }
}
