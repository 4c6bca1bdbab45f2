use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::resources::ResourcePool;

/// Top-level configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Defaults applied to new swarms
    #[serde(default)]
    pub swarm: SwarmDefaults,

    /// Resource lease settings
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Tier-two run settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Step strategy settings
    #[serde(default)]
    pub strategies: StrategiesConfig,

    /// Reasoning service connection and retry policy
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Task queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Event emitter settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// On-disk locations
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Swarm defaults
#[derive(Debug, Deserialize, Clone)]
pub struct SwarmDefaults {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    #[serde(default = "default_min_agents")]
    pub min_agents: usize,

    /// Fraction of agents that must agree on a decision
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,

    /// Bound on each reasoning call made while analyzing or strategizing
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,

    /// How long execution may proceed before the plan is revisited
    #[serde(default = "default_adaptation_interval_ms")]
    pub adaptation_interval_ms: u64,

    /// Runs of one swarm allowed in flight at once
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Upper bound on returns to Strategizing
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    /// Pool opened for each swarm
    #[serde(default = "default_swarm_pool")]
    pub pool: ResourcePool,

    /// Lifetime of the swarm pool
    #[serde(default = "default_swarm_pool_duration_ms")]
    pub pool_duration_ms: u64,
}

/// Resource allocator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AllocatorConfig {
    /// Hard ceiling on any lease lifetime
    #[serde(default = "default_max_lease_ms")]
    pub max_lease_ms: u64,

    /// Period of the expired-lease sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Lifetime requested for run leases
    #[serde(default = "default_run_duration_ms")]
    pub run_duration_ms: u64,

    /// Minimum a swarm must have left to start a run
    #[serde(default = "default_run_estimate")]
    pub run_estimate: ResourcePool,

    /// Amount reserved for each run
    #[serde(default = "default_run_reservation")]
    pub run_reservation: ResourcePool,
}

/// Tier-two orchestrator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Lifetime, and therefore deadline, of a step lease
    #[serde(default = "default_step_duration_ms")]
    pub step_duration_ms: u64,

    /// Amount reserved for each step on top of the strategy's estimate
    #[serde(default = "default_step_reservation")]
    pub step_reservation: ResourcePool,

    /// Strategy retried once when a step fails
    #[serde(default = "default_fallback_strategy")]
    pub fallback_strategy: String,

    /// Guard against routines that never reach an end location
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: u64,
}

/// Strategy configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StrategiesConfig {
    /// Tool-call rounds allowed in one conversational step
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,

    /// Credits charged per reasoning-service call
    #[serde(default = "default_credits_per_call")]
    pub credits_per_reasoning_call: u64,

    /// Confidence reported when the reasoning service gives none
    #[serde(default = "default_confidence")]
    pub default_confidence: f64,
}

/// Reasoning service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    /// "http" for an OpenAI-compatible endpoint, "offline" for the local planner
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Attempts per reasoning call before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// HTTP client timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Task queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_base_priority")]
    pub base_priority: u32,

    /// Subtracted from the base priority for premium requesters
    #[serde(default = "default_premium_adjustment")]
    pub premium_adjustment: u32,

    /// Queue-level bound on one task, independent of swarm timeouts
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// How long a timed-out task's swarm gets to review and settle
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Lifetime of a worker's claim on a task. Must outlast the task
    /// timeout plus the cancel grace.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deliveries before a task is failed for good
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

/// Event emitter configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Entries kept in the swarm → channel cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Buffered events per broadcast subscriber
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Directory of routine definitions
    #[serde(default = "default_routines_dir")]
    pub routines_dir: String,

    /// Run history file, relative to `data_dir`
    #[serde(default = "default_history_file")]
    pub history_file: String,
}

// Default values for optional configuration
fn default_max_agents() -> usize {
    5
}

fn default_min_agents() -> usize {
    1
}

fn default_consensus_threshold() -> f64 {
    0.66
}

fn default_decision_timeout_ms() -> u64 {
    30_000
}

fn default_adaptation_interval_ms() -> u64 {
    300_000
}

fn default_max_concurrent_runs() -> usize {
    1
}

fn default_max_replans() -> u32 {
    3
}

fn default_swarm_pool() -> ResourcePool {
    ResourcePool::new(1_000, 3_600_000, 4_096, 1_000)
}

fn default_swarm_pool_duration_ms() -> u64 {
    3_600_000
}

fn default_max_lease_ms() -> u64 {
    6 * 3_600_000
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_run_duration_ms() -> u64 {
    1_800_000
}

fn default_run_estimate() -> ResourcePool {
    ResourcePool::new(10, 60_000, 256, 1)
}

fn default_run_reservation() -> ResourcePool {
    ResourcePool::new(200, 900_000, 1_024, 100)
}

fn default_step_duration_ms() -> u64 {
    120_000
}

fn default_step_reservation() -> ResourcePool {
    ResourcePool::new(10, 60_000, 256, 1)
}

fn default_fallback_strategy() -> String {
    "reasoning".to_string()
}

fn default_max_steps_per_run() -> u64 {
    500
}

fn default_max_tool_iterations() -> usize {
    10
}

fn default_credits_per_call() -> u64 {
    5
}

fn default_confidence() -> f64 {
    0.7
}

fn default_provider() -> String {
    "offline".to_string()
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> usize {
    1024
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_base_priority() -> u32 {
    100
}

fn default_premium_adjustment() -> u32 {
    50
}

fn default_task_timeout_ms() -> u64 {
    3_600_000
}

fn default_cancel_grace_ms() -> u64 {
    60_000
}

fn default_lock_ttl_ms() -> u64 {
    3_700_000
}

fn default_worker_count() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_max_deliveries() -> u32 {
    3
}

fn default_cache_capacity() -> usize {
    1_000
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_routines_dir() -> String {
    "./routines".to_string()
}

fn default_history_file() -> String {
    "history.jsonl".to_string()
}

impl Default for SwarmDefaults {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            min_agents: default_min_agents(),
            consensus_threshold: default_consensus_threshold(),
            decision_timeout_ms: default_decision_timeout_ms(),
            adaptation_interval_ms: default_adaptation_interval_ms(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_replans: default_max_replans(),
            pool: default_swarm_pool(),
            pool_duration_ms: default_swarm_pool_duration_ms(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_lease_ms: default_max_lease_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            run_duration_ms: default_run_duration_ms(),
            run_estimate: default_run_estimate(),
            run_reservation: default_run_reservation(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_duration_ms: default_step_duration_ms(),
            step_reservation: default_step_reservation(),
            fallback_strategy: default_fallback_strategy(),
            max_steps_per_run: default_max_steps_per_run(),
        }
    }
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            credits_per_reasoning_call: default_credits_per_call(),
            default_confidence: default_confidence(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_base: default_api_base(),
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_priority: default_base_priority(),
            premium_adjustment: default_premium_adjustment(),
            task_timeout_ms: default_task_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            routines_dir: default_routines_dir(),
            history_file: default_history_file(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, with `SWARM_ENGINE__SECTION__KEY`
    /// environment variables taking precedence
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("SWARM_ENGINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that break queue delivery guarantees
    pub fn validate(&self) -> Result<()> {
        let queue = &self.queue;
        let busy_ms = queue.task_timeout_ms.saturating_add(queue.cancel_grace_ms);
        if queue.lock_ttl_ms <= busy_ms {
            bail!(
                "queue.lock_ttl_ms ({}) must exceed queue.task_timeout_ms + queue.cancel_grace_ms ({}), \
                 or a task could be redelivered while still being processed",
                queue.lock_ttl_ms,
                busy_ms
            );
        }
        Ok(())
    }

    /// Configuration with short timeouts and no backoff, for tests
    pub fn for_testing() -> Self {
        let mut config = Config::default();
        config.swarm.decision_timeout_ms = 2_000;
        config.reasoning.max_attempts = 2;
        config.reasoning.initial_backoff_ms = 1;
        config.reasoning.max_backoff_ms = 5;
        config.queue.poll_interval_ms = 10;
        config.queue.cancel_grace_ms = 5_000;
        config.allocator.sweep_interval_ms = 50;
        config.storage.data_dir = std::env::temp_dir()
            .join("swarm-engine-tests")
            .to_string_lossy()
            .to_string();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.queue.base_priority, 100);
        assert_eq!(config.strategies.max_tool_iterations, 10);
        assert_eq!(config.orchestrator.fallback_strategy, "reasoning");
        assert_eq!(config.swarm.pool.credits, 1_000);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
[swarm]
max_concurrent_runs = 4

[swarm.pool]
credits = 250
time_ms = 60000

[queue]
premium_adjustment = 30
"#,
        )
        .unwrap();
        assert_eq!(config.swarm.max_concurrent_runs, 4);
        assert_eq!(config.swarm.pool.credits, 250);
        assert_eq!(config.swarm.pool.steps, 0);
        assert_eq!(config.swarm.max_replans, 3);
        assert_eq!(config.queue.premium_adjustment, 30);
        assert_eq!(config.queue.base_priority, 100);
    }

    #[test]
    fn test_from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[reasoning]\nmodel = \"local-model\"\nmax_attempts = 7\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.reasoning.model, "local-model");
        assert_eq!(config.reasoning.max_attempts, 7);
        assert_eq!(config.reasoning.provider, "offline");
    }

    #[test]
    fn test_lock_ttl_must_outlast_task_timeout() {
        let err = Config::from_toml_str("[queue]\ntask_timeout_ms = 1000\nlock_ttl_ms = 1000\n")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("lock_ttl_ms"));

        // The cancel grace counts towards the time a task may stay claimed
        assert!(Config::from_toml_str(
            "[queue]\ntask_timeout_ms = 1000\ncancel_grace_ms = 500\nlock_ttl_ms = 1200\n"
        )
        .is_err());

        let config = Config::from_toml_str(
            "[queue]\ntask_timeout_ms = 1000\ncancel_grace_ms = 500\nlock_ttl_ms = 1501\n",
        )
        .unwrap();
        assert_eq!(config.queue.lock_ttl_ms, 1_501);
        assert!(Config::for_testing().validate().is_ok());
    }
}
