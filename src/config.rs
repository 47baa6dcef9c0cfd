//! Configuration types.
//!
//! Everything is read from environment variables with typed defaults.
//! Unparseable values are reported, never silently replaced by a default.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::job::PIPELINE_TASK;

/// What a pipeline does when one of its subjobs fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjobFailurePolicy {
    /// Fail the pipeline at the first failed step and cancel the rest.
    #[default]
    Abort,
    /// Let independent steps finish, then report per step.
    Continue,
}

impl FromStr for SubjobFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            other => Err(format!("expected 'abort' or 'continue', got '{other}'")),
        }
    }
}

/// Execution policy for one task type.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPolicy {
    /// Re-executions after the first failure.
    pub max_retries: u32,
    /// Deadline measured from claim. `None` disables the watchdog for the task.
    pub timeout: Option<Duration>,
    /// Only consulted for pipeline jobs.
    pub on_subjob_failure: SubjobFailurePolicy,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout: Some(Duration::from_secs(300)), // 5 minutes
            on_subjob_failure: SubjobFailurePolicy::Abort,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of concurrent executors.
    pub workers: usize,
    /// How long an idle executor sleeps before polling again.
    pub idle_backoff: Duration,
    /// Admission limit on queued jobs.
    pub max_queued: u64,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// Upper bound on a retry delay before jitter.
    pub retry_max_delay: Duration,
    /// Policy for tasks without an explicit entry.
    pub default_policy: TaskPolicy,
    /// Per-task overrides.
    pub task_policies: HashMap<String, TaskPolicy>,
    pub watchdog_interval: Duration,
    /// Cap on the long-poll `follow` a caller may request.
    pub max_follow: Duration,
    /// Longest per-job timeout a submission may ask for.
    pub max_timeout: Duration,
    /// Requeue jobs left running by a previous process.
    pub recover_on_start: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let default_policy = TaskPolicy::default();
        let mut task_policies = HashMap::new();
        // Parents are parked while children run, so they carry no deadline.
        task_policies.insert(
            PIPELINE_TASK.to_string(),
            TaskPolicy {
                max_retries: 0,
                timeout: None,
                ..default_policy.clone()
            },
        );
        Self {
            workers: 4,
            idle_backoff: Duration::from_millis(250),
            max_queued: 1000,
            retry_base: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(300),
            default_policy,
            task_policies,
            watchdog_interval: Duration::from_secs(1),
            max_follow: Duration::from_secs(60),
            max_timeout: Duration::from_secs(7 * 24 * 60 * 60),
            recover_on_start: true,
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let mut config = Self::default();

        if let Some(workers) = env.parse::<usize>("VELU_WORKERS")? {
            if workers == 0 {
                return Err(invalid("VELU_WORKERS", "must be at least 1"));
            }
            config.workers = workers;
        }
        if let Some(ms) = env.parse::<u64>("VELU_IDLE_BACKOFF_MS")? {
            config.idle_backoff = Duration::from_millis(ms.max(1));
        }
        if let Some(max) = env.parse::<u64>("VELU_MAX_QUEUED")? {
            config.max_queued = max;
        }
        if let Some(ms) = env.parse::<u64>("VELU_RETRY_BASE_MS")? {
            config.retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("VELU_RETRY_MAX_MS")? {
            config.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = env.parse::<u32>("VELU_MAX_RETRIES")? {
            config.default_policy.max_retries = retries;
        }
        if let Some(secs) = env.parse::<u64>("VELU_TASK_TIMEOUT_SECS")? {
            config.default_policy.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(policy) = env.parse::<SubjobFailurePolicy>("VELU_PIPELINE_ON_FAILURE")? {
            config.default_policy.on_subjob_failure = policy;
            if let Some(pipeline) = config.task_policies.get_mut(PIPELINE_TASK) {
                pipeline.on_subjob_failure = policy;
            }
        }
        if let Some(ms) = env.parse::<u64>("VELU_WATCHDOG_INTERVAL_MS")? {
            config.watchdog_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(secs) = env.parse::<u64>("VELU_MAX_FOLLOW_SECS")? {
            config.max_follow = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("VELU_MAX_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(invalid("VELU_MAX_TIMEOUT_SECS", "must be at least 1"));
            }
            config.max_timeout = Duration::from_secs(secs);
        }
        if let Some(recover) = env.parse_bool("VELU_RECOVER_ON_START")? {
            config.recover_on_start = recover;
        }

        Ok(config)
    }

    /// Override the policy for one task type.
    pub fn with_task_policy(mut self, task: impl Into<String>, policy: TaskPolicy) -> Self {
        self.task_policies.insert(task.into(), policy);
        self
    }

    /// Policy governing `task`.
    pub fn policy_for(&self, task: &str) -> &TaskPolicy {
        self.task_policies.get(task).unwrap_or(&self.default_policy)
    }
}

/// One accepted API key and its label.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub key: SecretString,
    pub label: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub db_path: PathBuf,
    /// Empty means development mode: no key required.
    pub api_keys: Vec<ApiKey>,
    /// Requests allowed per window and bucket. 0 disables rate limiting.
    pub rate_requests: u32,
    pub rate_window: Duration,
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8010".to_string(),
            db_path: PathBuf::from("data/jobs.db"),
            api_keys: Vec::new(),
            rate_requests: 0,
            rate_window: Duration::from_secs(60),
            max_request_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let mut config = Self::default();

        if let Some(bind) = env.text("VELU_BIND") {
            config.bind = bind;
        }
        if let Some(path) = env.text("TASK_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = env.text("API_KEYS") {
            config.api_keys = parse_api_keys(&raw);
        }
        if let Some(n) = env.parse::<u32>("RATE_REQUESTS")? {
            config.rate_requests = n;
        }
        if let Some(secs) = env.parse::<u64>("RATE_WINDOW_SEC")? {
            config.rate_window = Duration::from_secs(secs);
        }
        if let Some(bytes) = env.parse::<usize>("MAX_REQUEST_BYTES")? {
            config.max_request_bytes = bytes;
        }

        Ok(config)
    }

    pub fn with_api_keys(mut self, raw: &str) -> Self {
        self.api_keys = parse_api_keys(raw);
        self
    }

    pub fn rate_limit_enabled(&self) -> bool {
        self.rate_requests > 0 && !self.rate_window.is_zero()
    }
}

/// Parse `"k1:dev,k2:ops,k3"`; keys without a label get `default`.
pub fn parse_api_keys(raw: &str) -> Vec<ApiKey> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let (key, label) = match part.split_once(':') {
                Some((key, label)) => (key.trim(), label.trim()),
                None => (part, ""),
            };
            if key.is_empty() {
                return None;
            }
            let label = if label.is_empty() { "default" } else { label };
            Some(ApiKey {
                key: SecretString::from(key.to_string()),
                label: label.to_string(),
            })
        })
        .collect()
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Typed access to a key lookup. Blank values count as unset.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn text(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.text(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| invalid(key, format!("'{raw}': {e}")))
            })
            .transpose()
    }

    fn parse_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.text(key)
            .map(|raw| match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, format!("'{raw}' is not a boolean"))),
            })
            .transpose()
    }
}
