//! Shared fixtures for pipeline integration tests: a scripted generator and
//! an in-memory engine harness.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use genbatch_core::batch::{ItemPayload, ProgressSnapshot};
use genbatch_core::credentials::CredentialVault;
use genbatch_core::generation::{GeneratedImage, GenerationError, ImageGenerator};
use genbatch_core::retry::RetryPolicy;
use genbatch_core::types::DbId;
use genbatch_pipeline::reclaimer;
use genbatch_pipeline::{
    BatchCoordinator, CoordinatorConfig, PipelineContext, SubmitBatch, WorkerPool,
    WorkerPoolConfig,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const API_KEY: &str = "sk-test-0123456789";

pub const KEY_A: [u8; 32] = [0x11; 32];
pub const KEY_B: [u8; 32] = [0x22; 32];

// ---------------------------------------------------------------------------
// Scripted generator
// ---------------------------------------------------------------------------

/// One scripted response for a prompt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(GenerationError),
    /// Sleep, then succeed.
    Slow(Duration),
    /// Signal `started`, wait for `release`, then succeed.
    Hold,
    /// Like `Hold`, but fail once released.
    HoldThenFail(GenerationError),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub prompt: String,
    pub api_key: String,
    pub at: Instant,
}

/// Generator whose responses are scripted per prompt. Prompts without a
/// script (or whose script ran out) succeed immediately.
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    always: Mutex<HashMap<String, GenerationError>>,
    calls: Mutex<Vec<Call>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_overlap: Mutex<usize>,
    started: Semaphore,
    release: Semaphore,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            always: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_overlap: Mutex::new(0),
            started: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    pub fn script(&self, prompt: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(prompt.to_string(), steps.into());
    }

    /// Every call for `prompt` fails with `err`.
    pub fn always_fail(&self, prompt: &str, err: GenerationError) {
        self.always.lock().unwrap().insert(prompt.to_string(), err);
    }

    /// Wait until a `Hold` step has started.
    pub async fn wait_started(&self) {
        self.started.acquire().await.unwrap().forget();
    }

    /// Let held calls finish.
    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, prompt: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.prompt == prompt).collect()
    }

    /// Highest number of simultaneous calls seen for any single prompt.
    pub fn max_overlap(&self) -> usize {
        *self.max_overlap.lock().unwrap()
    }

    fn enter(&self, prompt: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let n = in_flight.entry(prompt.to_string()).or_insert(0);
        *n += 1;
        let mut max = self.max_overlap.lock().unwrap();
        *max = (*max).max(*n);
    }

    fn exit(&self, prompt: &str) {
        if let Some(n) = self.in_flight.lock().unwrap().get_mut(prompt) {
            *n -= 1;
        }
    }

    async fn hold(&self) {
        self.started.add_permits(1);
        self.release.acquire().await.unwrap().forget();
    }

    fn next_step(&self, prompt: &str) -> Step {
        if let Some(err) = self.always.lock().unwrap().get(prompt) {
            return Step::Fail(err.clone());
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(prompt)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

/// Decrements the in-flight count even when the call future is dropped by
/// a timeout.
struct InFlight<'a> {
    generator: &'a ScriptedGenerator,
    prompt: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.generator.exit(&self.prompt);
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        api_key: &str,
        payload: &ItemPayload,
    ) -> Result<GeneratedImage, GenerationError> {
        let prompt = payload.prompt.clone();
        self.calls.lock().unwrap().push(Call {
            prompt: prompt.clone(),
            api_key: api_key.to_string(),
            at: Instant::now(),
        });
        self.enter(&prompt);
        let _guard = InFlight {
            generator: self,
            prompt: prompt.clone(),
        };

        match self.next_step(&prompt) {
            Step::Succeed => {}
            Step::Fail(err) => return Err(err),
            Step::Slow(delay) => tokio::time::sleep(delay).await,
            Step::Hold => self.hold().await,
            Step::HoldThenFail(err) => {
                self.hold().await;
                return Err(err);
            }
        }
        Ok(GeneratedImage::new(
            format!("img:{prompt}").into_bytes(),
            "image/png",
        ))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(40),
    }
}

pub fn pool_config(workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        worker_count: workers,
        lease_duration: Duration::from_secs(30),
        api_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        storage_retry_attempts: 3,
        storage_retry_delay: Duration::from_millis(1),
        worker_prefix: "test-worker".to_string(),
    }
}

pub fn prompts(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("prompt {i}")).collect()
}

/// A running in-memory engine.
pub struct Harness {
    pub coordinator: BatchCoordinator,
    pub ctx: PipelineContext,
    pub generator: Arc<ScriptedGenerator>,
    pub vault: CredentialVault,
    pool: WorkerPool,
    reclaim_cancel: CancellationToken,
    reclaim_task: JoinHandle<()>,
}

impl Harness {
    pub fn start(generator: Arc<ScriptedGenerator>, config: WorkerPoolConfig) -> Self {
        let ctx = PipelineContext::in_memory(CredentialVault::new(KEY_A));
        Self::start_with(ctx.clone(), ctx, generator, config)
    }

    /// Start with separate contexts for submission and execution (e.g. to
    /// simulate the workers holding a different master key).
    pub fn start_with(
        ctx: PipelineContext,
        worker_ctx: PipelineContext,
        generator: Arc<ScriptedGenerator>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self::start_configured(ctx, worker_ctx, generator, config, CoordinatorConfig::default())
    }

    /// Like [`start_with`](Self::start_with) with explicit submission limits.
    pub fn start_configured(
        ctx: PipelineContext,
        worker_ctx: PipelineContext,
        generator: Arc<ScriptedGenerator>,
        config: WorkerPoolConfig,
        limits: CoordinatorConfig,
    ) -> Self {
        let coordinator = BatchCoordinator::new(ctx.clone(), limits);
        let pool = WorkerPool::start(
            worker_ctx.clone(),
            Arc::clone(&generator) as Arc<dyn ImageGenerator>,
            fast_retry(),
            config,
        );
        let reclaim_cancel = CancellationToken::new();
        let reclaim_task = tokio::spawn(reclaimer::run(
            worker_ctx,
            Duration::from_millis(20),
            reclaim_cancel.clone(),
        ));
        Self {
            coordinator,
            ctx,
            generator,
            vault: CredentialVault::new(KEY_A),
            pool,
            reclaim_cancel,
            reclaim_task,
        }
    }

    pub async fn submit(&self, prompts: &[String]) -> DbId {
        self.coordinator
            .submit(SubmitBatch {
                owner_id: 42,
                credential: self.vault.encrypt(API_KEY).unwrap(),
                items: prompts.iter().map(ItemPayload::new).collect(),
            })
            .await
            .unwrap()
    }

    pub async fn wait(&self, batch_id: DbId) -> ProgressSnapshot {
        self.coordinator
            .wait_for_terminal(batch_id, Duration::from_secs(10))
            .await
            .unwrap()
    }

    pub async fn stop(self) {
        self.generator.release(1024);
        self.pool.shutdown().await;
        self.reclaim_cancel.cancel();
        self.reclaim_task.await.unwrap();
    }
}
