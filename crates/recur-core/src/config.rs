use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LOCK_GRACE_SECS: u64 = 60;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 16;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

/// Top-level config (recur.toml + RECUR_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecurConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Root of the `artifacts/<jobId>/<timestamp>_<runId>/` tree.
    #[serde(default = "default_artifacts_dir")]
    pub dir: String,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Added to a job's `maxRunSeconds` to form its lock expiry, so a crashed
    /// process cannot hold a job lock forever.
    #[serde(default = "default_lock_grace_secs")]
    pub lock_grace_secs: u64,
    /// Maximum DUE runs waiting behind a `queue` job before new slots are
    /// recorded as failed.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            lock_grace_secs: DEFAULT_LOCK_GRACE_SECS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }
}

/// External executor process. When `command` is unset every real run fails
/// with `EXECUTOR_UNCONFIGURED`; dry runs still work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_lock_grace_secs() -> u64 {
    DEFAULT_LOCK_GRACE_SECS
}
fn default_max_queue_depth() -> usize {
    DEFAULT_MAX_QUEUE_DEPTH
}
fn default_max_concurrent_runs() -> usize {
    DEFAULT_MAX_CONCURRENT_RUNS
}
fn recur_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.recur", home)
}
fn default_db_path() -> String {
    format!("{}/recur.db", recur_home())
}
fn default_artifacts_dir() -> String {
    format!("{}/artifacts", recur_home())
}

impl RecurConfig {
    /// Load config from a TOML file with RECUR_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.recur/recur.toml
    ///
    /// A missing file is not an error; defaults fill every field. Nested keys
    /// are addressed with a double underscore, e.g.
    /// `RECUR_RUNNER__MAX_CONCURRENT_RUNS=8`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(RecurConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RECUR_").split("__"))
    }
}

fn default_config_path() -> String {
    format!("{}/recur.toml", recur_home())
}
