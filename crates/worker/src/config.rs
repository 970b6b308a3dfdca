use std::path::PathBuf;
use std::time::Duration;

use genbatch_core::batch::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BATCH_SIZE};
use genbatch_core::credentials::{CredentialError, CredentialVault};
use genbatch_core::retry::RetryPolicy;
use genbatch_pipeline::{CoordinatorConfig, WorkerPoolConfig};

/// Errors raised while loading [`WorkerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("CREDENTIAL_KEY is unusable: {0}")]
    CredentialKey(#[from] CredentialError),
}

/// Worker process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Master key for opening batch credentials.
    pub vault: CredentialVault,
    pub generation_api_url: String,
    /// Root directory for stored result blobs.
    pub results_dir: PathBuf,
    pub worker_count: usize,
    pub lease_duration: Duration,
    pub api_timeout: Duration,
    pub poll_interval: Duration,
    pub reclaim_interval: Duration,
    pub max_attempts: i32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub storage_retry_attempts: u32,
    pub max_batch_size: usize,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                   |
    /// |--------------------------|---------------------------|
    /// | `DATABASE_URL`           | required                  |
    /// | `CREDENTIAL_KEY`         | required (64 hex chars)   |
    /// | `GENERATION_API_URL`     | `http://localhost:8080`   |
    /// | `RESULTS_DIR`            | `./data/results`          |
    /// | `WORKER_COUNT`           | `4`                       |
    /// | `LEASE_DURATION_SECS`    | `120`                     |
    /// | `API_TIMEOUT_SECS`       | `60`                      |
    /// | `POLL_INTERVAL_MS`       | `1000`                    |
    /// | `RECLAIM_INTERVAL_SECS`  | `30`                      |
    /// | `MAX_ATTEMPTS`           | `3`                       |
    /// | `RETRY_BASE_DELAY_MS`    | `1000`                    |
    /// | `RETRY_MAX_DELAY_SECS`   | `60`                      |
    /// | `STORAGE_RETRY_ATTEMPTS` | `3`                       |
    /// | `MAX_BATCH_SIZE`         | `100`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env.required("DATABASE_URL")?;
        let vault = CredentialVault::from_hex(&env.required("CREDENTIAL_KEY")?)?;
        let generation_api_url = env
            .get("GENERATION_API_URL")
            .unwrap_or_else(|| "http://localhost:8080".into());
        let results_dir = PathBuf::from(
            env.get("RESULTS_DIR")
                .unwrap_or_else(|| "./data/results".into()),
        );

        let worker_count: usize = env.parse("WORKER_COUNT", 4)?;
        let lease_duration = Duration::from_secs(env.parse("LEASE_DURATION_SECS", 120)?);
        let api_timeout = Duration::from_secs(env.parse("API_TIMEOUT_SECS", 60)?);
        let poll_interval = Duration::from_millis(env.parse("POLL_INTERVAL_MS", 1000)?);
        let reclaim_interval = Duration::from_secs(env.parse("RECLAIM_INTERVAL_SECS", 30)?);
        let max_attempts: i32 = env.parse("MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let retry_base_delay = Duration::from_millis(env.parse("RETRY_BASE_DELAY_MS", 1000)?);
        let retry_max_delay = Duration::from_secs(env.parse("RETRY_MAX_DELAY_SECS", 60)?);
        let storage_retry_attempts: u32 = env.parse("STORAGE_RETRY_ATTEMPTS", 3)?;
        let max_batch_size: usize = env.parse("MAX_BATCH_SIZE", DEFAULT_MAX_BATCH_SIZE)?;

        env.check("WORKER_COUNT", worker_count >= 1, "must be at least 1")?;
        env.check("MAX_ATTEMPTS", max_attempts >= 1, "must be at least 1")?;
        env.check("MAX_BATCH_SIZE", max_batch_size >= 1, "must be at least 1")?;
        env.check(
            "STORAGE_RETRY_ATTEMPTS",
            storage_retry_attempts >= 1,
            "must be at least 1",
        )?;
        env.check(
            "RECLAIM_INTERVAL_SECS",
            !reclaim_interval.is_zero(),
            "must be positive",
        )?;
        env.check(
            "LEASE_DURATION_SECS",
            lease_duration > api_timeout,
            "must exceed API_TIMEOUT_SECS",
        )?;
        env.check(
            "RETRY_MAX_DELAY_SECS",
            retry_max_delay >= retry_base_delay,
            "must not be below RETRY_BASE_DELAY_MS",
        )?;

        Ok(Self {
            database_url,
            vault,
            generation_api_url,
            results_dir,
            worker_count,
            lease_duration,
            api_timeout,
            poll_interval,
            reclaim_interval,
            max_attempts,
            retry_base_delay,
            retry_max_delay,
            storage_retry_attempts,
            max_batch_size,
        })
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: self.worker_count,
            lease_duration: self.lease_duration,
            api_timeout: self.api_timeout,
            poll_interval: self.poll_interval,
            storage_retry_attempts: self.storage_retry_attempts,
            ..WorkerPoolConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts as u32,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// Submission limits for a coordinator sharing this database.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_batch_size: self.max_batch_size,
            max_attempts: self.max_attempts,
        }
    }
}

/// Variable source with typed accessors.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn check(&self, var: &'static str, ok: bool, reason: &str) -> Result<(), ConfigError> {
        if ok {
            return Ok(());
        }
        Err(ConfigError::Invalid {
            var,
            value: self.get(var).unwrap_or_default(),
            reason: reason.to_string(),
        })
    }
}
