//! Fixed-size pool of Tokio tasks that lease and execute batch items.
//!
//! Each worker loops: lease an item, open the batch credential, call the
//! generator under a timeout, store the result, and end the lease. Errors
//! are classified by the [`RetryPolicy`] into a delayed requeue or a
//! terminal failure. Every terminal transition returned by the queue is
//! reported to the [`ProgressTracker`](crate::progress::ProgressTracker)
//! exactly once.
//!
//! Shutdown is cooperative: workers stop leasing when the token is
//! cancelled, and an item already in flight runs to completion.

use std::sync::Arc;
use std::time::Duration;

use genbatch_core::batch::{describe_error, error_kind, ResultAsset};
use genbatch_core::generation::{GeneratedImage, GenerationError, ImageGenerator};
use genbatch_core::retry::{ErrorClass, RetryDecision, RetryPolicy};
use genbatch_core::types::DbId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::context::PipelineContext;
use crate::error::{QueueError, StorageError};
use crate::queue::{Halt, Lease, Nack};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunables for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// How long a lease is held before it can be reclaimed. Must exceed
    /// `api_timeout` plus storage time.
    pub lease_duration: Duration,
    pub api_timeout: Duration,
    /// Longest an idle worker waits before polling the queue again.
    pub poll_interval: Duration,
    /// Attempts to store one successful output before failing the item.
    pub storage_retry_attempts: u32,
    pub storage_retry_delay: Duration,
    /// Prefix of worker IDs recorded on leases (`<prefix>-<n>`).
    pub worker_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lease_duration: Duration::from_secs(120),
            api_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            storage_retry_attempts: 3,
            storage_retry_delay: Duration::from_millis(200),
            worker_prefix: "worker".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Why the batch credential could not be used.
enum CredentialFailure {
    Unavailable(String),
    Store(String),
}

/// Runs one leased item to the end of its lease.
pub struct ItemExecutor {
    ctx: PipelineContext,
    generator: Arc<dyn ImageGenerator>,
    retry: RetryPolicy,
    config: WorkerPoolConfig,
}

impl ItemExecutor {
    pub fn new(
        ctx: PipelineContext,
        generator: Arc<dyn ImageGenerator>,
        retry: RetryPolicy,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            ctx,
            generator,
            retry,
            config,
        }
    }

    /// Execute a leased item: generate, store, and end the lease.
    pub async fn process(&self, lease: Lease) {
        let item = &lease.item;
        tracing::debug!(
            batch_id = item.batch_id,
            item_id = item.id,
            worker_id = %lease.worker_id,
            attempt = item.attempt_count,
            "Item leased",
        );

        if let Err(e) = self.ctx.tracker.on_item_leased(item.batch_id).await {
            tracing::warn!(batch_id = item.batch_id, error = %e, "Failed to mark batch running");
        }

        let api_key = match self.open_credential(item.batch_id).await {
            Ok(key) => key,
            Err(CredentialFailure::Unavailable(reason)) => {
                self.abort_batch(&lease, reason).await;
                return;
            }
            Err(CredentialFailure::Store(e)) => {
                // Leave the lease to expire; the item is retried later.
                tracing::error!(
                    batch_id = item.batch_id,
                    item_id = item.id,
                    error = %e,
                    "Failed to load batch credential",
                );
                return;
            }
        };

        let outcome = match tokio::time::timeout(
            self.config.api_timeout,
            self.generator.generate(api_key.as_str(), &item.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(self.config.api_timeout)),
        };
        drop(api_key);

        match outcome {
            Ok(image) => self.complete(&lease, image).await,
            Err(e) => self.retry_or_fail(&lease, e).await,
        }
    }

    async fn open_credential(&self, batch_id: DbId) -> Result<Zeroizing<String>, CredentialFailure> {
        let sealed = match self.ctx.store.credential(batch_id).await {
            Ok(Some(sealed)) => sealed,
            Ok(None) => {
                return Err(CredentialFailure::Unavailable(describe_error(
                    error_kind::CREDENTIAL,
                    "batch credential has been discarded",
                )))
            }
            Err(e) => return Err(CredentialFailure::Store(e.to_string())),
        };
        self.ctx
            .vault
            .open(&sealed)
            .map_err(|e| CredentialFailure::Unavailable(describe_error(error_kind::CREDENTIAL, e)))
    }

    /// Fail the current item and every queued sibling.
    async fn abort_batch(&self, lease: &Lease, reason: String) {
        let batch_id = lease.item.batch_id;
        tracing::error!(batch_id, item_id = lease.item.id, reason = %reason, "Aborting batch");

        if let Err(e) = self.ctx.store.abort(batch_id, &reason).await {
            tracing::error!(batch_id, error = %e, "Failed to record batch abort");
        }
        self.end_lease(lease, Nack::Fail { error: reason.clone() }).await;

        match self.ctx.queue.halt_batch(batch_id, Halt::Aborted(reason)).await {
            Ok(failed) => self.ctx.tracker.report_all(&failed).await,
            Err(e) => tracing::error!(batch_id, error = %e, "Failed to halt aborted batch"),
        }
    }

    async fn complete(&self, lease: &Lease, image: GeneratedImage) {
        let item = &lease.item;
        match self.ctx.queue.is_held(lease.id).await {
            Ok(true) => {}
            Ok(false) => {
                // Reclaimed while generating; the item's outcome is no longer ours.
                tracing::warn!(
                    batch_id = item.batch_id,
                    item_id = item.id,
                    attempt = item.attempt_count,
                    "Lease lost before storing result, dropping output",
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    batch_id = item.batch_id,
                    item_id = item.id,
                    error = %e,
                    "Lease check failed, storing result anyway",
                );
            }
        }

        let asset = match self.save_with_retry(lease, &image).await {
            Ok(asset) => asset,
            Err(e) => {
                let error = describe_error(error_kind::STORAGE, &e);
                self.end_lease(lease, Nack::Fail { error }).await;
                return;
            }
        };

        match self.ctx.queue.ack(lease.id, asset.id).await {
            Ok(done) => {
                tracing::info!(
                    batch_id = item.batch_id,
                    item_id = item.id,
                    attempt = item.attempt_count,
                    "Item succeeded",
                );
                self.ctx.tracker.report_all(&[done]).await;
            }
            Err(QueueError::LeaseLost(_)) => {
                tracing::warn!(
                    batch_id = item.batch_id,
                    item_id = item.id,
                    attempt = item.attempt_count,
                    "Lease lost before ack, discarding result",
                );
                self.discard(&asset).await;
            }
            Err(e) => {
                tracing::error!(batch_id = item.batch_id, item_id = item.id, error = %e, "Ack failed");
                self.discard(&asset).await;
            }
        }
    }

    /// Remove an output that was never committed to its item.
    async fn discard(&self, asset: &ResultAsset) {
        if let Err(e) = self.ctx.results.discard(asset).await {
            tracing::error!(
                item_id = asset.item_id,
                asset_id = asset.id,
                error = %e,
                "Failed to discard uncommitted result",
            );
        }
    }

    async fn save_with_retry(
        &self,
        lease: &Lease,
        image: &GeneratedImage,
    ) -> Result<ResultAsset, StorageError> {
        let attempts = self.config.storage_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.ctx.results.save(&lease.item, image).await {
                Ok(asset) => return Ok(asset),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        item_id = lease.item.id,
                        attempt,
                        error = %e,
                        "Result storage failed, retrying",
                    );
                    tokio::time::sleep(self.config.storage_retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(item_id = lease.item.id, attempt, error = %e, "Result storage failed");
                    return Err(e);
                }
            }
        }
    }

    async fn retry_or_fail(&self, lease: &Lease, err: GenerationError) {
        let item = &lease.item;
        let class = err.class();
        let attempt = u32::try_from(item.attempt_count).unwrap_or(u32::MAX);

        let decision = if item.attempts_exhausted() {
            RetryDecision::Fail
        } else {
            self.retry.decide(class, attempt)
        };

        let nack = match decision {
            RetryDecision::Retry { delay } => {
                let delay = err.retry_after().map_or(delay, |min| delay.max(min));
                tracing::warn!(
                    batch_id = item.batch_id,
                    item_id = item.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Generation failed, retrying",
                );
                Nack::Requeue {
                    delay,
                    error: describe_error(error_kind::TRANSIENT_API, &err),
                }
            }
            RetryDecision::Fail => {
                let kind = match class {
                    ErrorClass::Transient => error_kind::TRANSIENT_API,
                    ErrorClass::Permanent => error_kind::PERMANENT_API,
                };
                tracing::warn!(
                    batch_id = item.batch_id,
                    item_id = item.id,
                    attempt,
                    error = %err,
                    "Generation failed permanently",
                );
                Nack::Fail {
                    error: describe_error(kind, &err),
                }
            }
        };
        self.end_lease(lease, nack).await;
    }

    /// `nack` the lease and report any terminal transition.
    async fn end_lease(&self, lease: &Lease, nack: Nack) {
        let item = &lease.item;
        match self.ctx.queue.nack(lease.id, nack).await {
            Ok(Some(done)) => self.ctx.tracker.report_all(&[done]).await,
            Ok(None) => {}
            Err(QueueError::LeaseLost(_)) => {
                tracing::warn!(batch_id = item.batch_id, item_id = item.id, "Lease lost before nack");
            }
            Err(e) => {
                tracing::error!(batch_id = item.batch_id, item_id = item.id, error = %e, "Nack failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Handle to the running workers.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers.
    pub fn start(
        ctx: PipelineContext,
        generator: Arc<dyn ImageGenerator>,
        retry: RetryPolicy,
        config: WorkerPoolConfig,
    ) -> Self {
        Self::start_with_token(ctx, generator, retry, config, CancellationToken::new())
    }

    /// Like [`start`](Self::start), stopping when `cancel` (or a parent
    /// token) is cancelled.
    pub fn start_with_token(
        ctx: PipelineContext,
        generator: Arc<dyn ImageGenerator>,
        retry: RetryPolicy,
        config: WorkerPoolConfig,
        cancel: CancellationToken,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        let prefix = config.worker_prefix.clone();
        let executor = Arc::new(ItemExecutor::new(ctx, generator, retry, config));

        tracing::info!(worker_count, "Worker pool starting");
        let handles = (0..worker_count)
            .map(|n| {
                let worker_id = format!("{prefix}-{n}");
                tokio::spawn(run_worker(Arc::clone(&executor), worker_id, cancel.clone()))
            })
            .collect();

        Self { cancel, handles }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop leasing, let in-flight items finish, and join every worker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn run_worker(executor: Arc<ItemExecutor>, worker_id: String, cancel: CancellationToken) {
    let lease_duration = executor.config.lease_duration;
    let poll_interval = executor.config.poll_interval;
    tracing::debug!(worker_id = %worker_id, "Worker started");

    while !cancel.is_cancelled() {
        match executor.ctx.queue.lease(&worker_id, lease_duration).await {
            Ok(Some(lease)) => executor.process(lease).await,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = executor.ctx.queue.wait_for_work(poll_interval) => {}
                }
            }
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Lease failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    tracing::debug!(worker_id = %worker_id, "Worker stopped");
}
