use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CAMPAIGN_FLOWS__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_key_prefix() -> String {
    "flows".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            redis: RedisConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            recovery: RecoveryConfig::default(),
            gate: GateConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

// ─── Scheduler Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum executions advanced per tick.
    #[serde(default = "default_due_batch_size")]
    pub due_batch_size: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_due_batch_size() -> usize {
    500
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            due_batch_size: default_due_batch_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

// ─── Dispatch Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Audiences up to this size are sent as one direct batch; larger ones
    /// are chunked.
    #[serde(default = "default_direct_send_threshold")]
    pub direct_send_threshold: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Share of the audience that must hold a terminal send record before a
    /// stage counts as complete.
    #[serde(default = "default_completion_ratio")]
    pub completion_ratio: f64,
}

fn default_direct_send_threshold() -> usize {
    5_000
}

fn default_chunk_size() -> usize {
    1_000
}

fn default_completion_ratio() -> f64 {
    0.8
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            direct_send_threshold: default_direct_send_threshold(),
            chunk_size: default_chunk_size(),
            completion_ratio: default_completion_ratio(),
        }
    }
}

// ─── Recovery Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_stale_executing_secs")]
    pub stale_executing_secs: u64,
    #[serde(default = "default_stale_chunked_secs")]
    pub stale_chunked_secs: u64,
    /// Queued tasks at or below this count do not keep a stale stage alive.
    #[serde(default = "default_negligible_queued_tasks")]
    pub negligible_queued_tasks: usize,
    /// Upper bound on orphaned pending sends re-enqueued per stage per sweep.
    #[serde(default = "default_orphan_requeue_limit")]
    pub orphan_requeue_limit: usize,
}

fn default_stale_executing_secs() -> u64 {
    30 * 60
}

fn default_stale_chunked_secs() -> u64 {
    10 * 60
}

fn default_negligible_queued_tasks() -> usize {
    0
}

fn default_orphan_requeue_limit() -> usize {
    5_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_executing_secs: default_stale_executing_secs(),
            stale_chunked_secs: default_stale_chunked_secs(),
            negligible_queued_tasks: default_negligible_queued_tasks(),
            orphan_requeue_limit: default_orphan_requeue_limit(),
        }
    }
}

// ─── Channel Gate Config ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_email_per_window")]
    pub email_per_window: u64,
    #[serde(default = "default_sms_per_window")]
    pub sms_per_window: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_email_per_window() -> u64 {
    600
}

fn default_sms_per_window() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_failure_threshold() -> u64 {
    10
}

fn default_failure_window_secs() -> u64 {
    300
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_max_jitter_ms() -> u64 {
    2_000
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            email_per_window: default_email_per_window(),
            sms_per_window: default_sms_per_window(),
            window_secs: default_window_secs(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

// ─── Worker Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dequeue_batch")]
    pub dequeue_batch: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_worker_count() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_dequeue_batch() -> usize {
    50
}

fn default_task_timeout_ms() -> u64 {
    120_000
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            dequeue_batch: default_dequeue_batch(),
            task_timeout_ms: default_task_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file and environment
    /// variables. Environment values win over the file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_FLOWS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redis.urls"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
