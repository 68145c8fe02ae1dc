use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const MAX_JITTER_MS: u64 = 300_000;

/// How overlapping runs of the same job are admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyPolicy {
    /// Runs may overlap freely; no lock is taken.
    #[default]
    Allow,
    /// A new run is rejected while another run holds the job lock.
    Skip,
    /// A new run waits (FIFO, bounded depth) until the job lock is free.
    Queue,
    /// The running run is cancelled and the new run takes over the lock.
    CancelPrevious,
}

impl ConcurrencyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyPolicy::Allow => "allow",
            ConcurrencyPolicy::Skip => "skip",
            ConcurrencyPolicy::Queue => "queue",
            ConcurrencyPolicy::CancelPrevious => "cancel-previous",
        }
    }

    /// Every policy except `allow` serialises runs through a lock on the job id.
    pub fn requires_lock(&self) -> bool {
        !matches!(self, ConcurrencyPolicy::Allow)
    }
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Immediate,
    #[default]
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkScope {
    /// No outbound network access.
    None,
    /// Only hosts in `domainAllowlist` (and their subdomains).
    Allowlist,
    #[default]
    Open,
}

/// Resource caps handed to the executor. Only `max_run_seconds` is enforced
/// by the runner itself; the rest are advisory and recorded after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimits {
    pub network: NetworkScope,
    pub domain_allowlist: Vec<String>,
    /// Requests per minute, keyed by hostname.
    pub rate_limits: BTreeMap<String, u32>,
    pub max_bandwidth_bytes: Option<u64>,
    pub max_steps: u32,
    pub max_run_seconds: u64,
    pub max_model_tokens: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            network: NetworkScope::Open,
            domain_allowlist: Vec::new(),
            rate_limits: BTreeMap::new(),
            max_bandwidth_bytes: None,
            max_steps: 50,
            max_run_seconds: 300,
            max_model_tokens: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    /// Explicit per-attempt delays in milliseconds.
    pub delays: Vec<u64>,
    /// Error codes that are always retried, on top of the transient defaults.
    pub retryable_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::Exponential,
            delays: vec![1_000, 5_000, 30_000],
            retryable_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertPolicy {
    pub on_success: bool,
    pub on_failure: bool,
    pub on_material_change: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            on_success: false,
            on_failure: true,
            on_material_change: false,
        }
    }
}

/// A named, versioned recurring task.
///
/// Every field has a documented default so a definition file only needs
/// `id`, `schedule` and `graphId`; see [`crate::definition`] for the
/// validate-then-normalize step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobDefinition {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub enabled: bool,
    /// Cron expression (5 or 6 fields) evaluated in `timezone`.
    pub schedule: String,
    /// IANA timezone id.
    pub timezone: String,
    pub jitter_ms: u64,
    pub catchup: bool,
    pub concurrency: ConcurrencyPolicy,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Executor capability to invoke.
    pub graph_id: String,
    /// Opaque executor inputs, passed through unchanged.
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub resources: ResourceLimits,
    pub retry: RetryPolicy,
    pub alerts: AlertPolicy,
    pub labels: BTreeMap<String, String>,
}

impl Default for JobDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            version: 1,
            name: String::new(),
            description: String::new(),
            owner: String::new(),
            enabled: true,
            schedule: String::new(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            jitter_ms: 0,
            catchup: false,
            concurrency: ConcurrencyPolicy::Allow,
            priority: 0,
            not_before: None,
            not_after: None,
            graph_id: String::new(),
            inputs: serde_json::Map::new(),
            resources: ResourceLimits::default(),
            retry: RetryPolicy::default(),
            alerts: AlertPolicy::default(),
            labels: BTreeMap::new(),
        }
    }
}

/// Per-job schedule cache. Always re-derivable from the job's cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub job_id: String,
    /// Jittered instant at which the next run becomes due. `None` = suppressed.
    pub next_due: Option<DateTime<Utc>>,
    /// Un-jittered cron instant `next_due` was derived from.
    pub next_occurrence: Option<DateTime<Utc>>,
    /// Cron instant of the most recently fired slot.
    pub last_scheduled: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub timezone: String,
}

impl ScheduleState {
    pub fn empty(job_id: &str, timezone: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            next_due: None,
            next_occurrence: None,
            last_scheduled: None,
            last_success: None,
            last_attempt: None,
            timezone: timezone.to_string(),
        }
    }
}

/// Run lifecycle: `DUE → STARTING → RUNNING → {SUCCEEDED | FAILED_RETRYABLE | FAILED | CANCELLED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Due,
    Starting,
    Running,
    Succeeded,
    FailedRetryable,
    Failed,
    Cancelled,
}

impl RunState {
    pub const ACTIVE: [RunState; 2] = [RunState::Starting, RunState::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Due => "DUE",
            RunState::Starting => "STARTING",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::FailedRetryable => "FAILED_RETRYABLE",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    /// Terminal, or handed off to a retry run. Either way this row is final.
    pub fn is_finished(&self) -> bool {
        self.is_terminal() || *self == RunState::FailedRetryable
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DUE" => Ok(RunState::Due),
            "STARTING" => Ok(RunState::Starting),
            "RUNNING" => Ok(RunState::Running),
            "SUCCEEDED" => Ok(RunState::Succeeded),
            "FAILED_RETRYABLE" => Ok(RunState::FailedRetryable),
            "FAILED" => Ok(RunState::Failed),
            "CANCELLED" => Ok(RunState::Cancelled),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// What created a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Retry,
    Manual,
    Dry,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Retry => "retry",
            RunTrigger::Manual => "manual",
            RunTrigger::Dry => "dry",
        }
    }
}

impl std::str::FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "retry" => Ok(RunTrigger::Retry),
            "manual" => Ok(RunTrigger::Manual),
            "dry" => Ok(RunTrigger::Dry),
            other => Err(format!("unknown run trigger: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub steps: u64,
    pub tokens: u64,
    pub duration_ms: u64,
    pub bandwidth_bytes: u64,
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub id: String,
    pub job_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: RunState,
    /// 0-based retry attempt.
    pub attempt: u32,
    pub trigger: RunTrigger,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub resource_usage: ResourceUsage,
    /// Replaces the job's `inputs` for this run (manual triggers, inherited by retries).
    pub inputs_override: Option<serde_json::Map<String, serde_json::Value>>,
    /// SHA-256 of the executor output, hex encoded.
    pub output_hash: Option<String>,
}

impl RunMetadata {
    /// A fresh DUE run with a time-sortable UUIDv7 id.
    pub fn new_due(
        job_id: &str,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: RunTrigger,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_id: job_id.to_string(),
            scheduled_at,
            started_at: None,
            completed_at: None,
            state: RunState::Due,
            attempt,
            trigger,
            error_code: None,
            error_message: None,
            resource_usage: ResourceUsage::default(),
            inputs_override: None,
            output_hash: None,
        }
    }

    /// Inputs the executor should see: the override if present, else the job's.
    pub fn effective_inputs<'a>(
        &'a self,
        job: &'a JobDefinition,
    ) -> &'a serde_json::Map<String, serde_json::Value> {
        self.inputs_override.as_ref().unwrap_or(&job.inputs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "debug" => Ok(EventLevel::Debug),
            "info" => Ok(EventLevel::Info),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            other => Err(format!("unknown event level: {other}")),
        }
    }
}

/// Append-only audit entry for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub event: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl RunEvent {
    /// One line of the structured `stdout.log` artifact.
    pub fn log_line(&self) -> String {
        let mut line = format!(
            "{} {:<5} {} {}",
            crate::time::fmt_ts(self.timestamp),
            self.level.as_str().to_uppercase(),
            self.event,
            self.message
        );
        if let Some(ref data) = self.data {
            line.push(' ');
            line.push_str(&data.to_string());
        }
        line
    }
}

/// Storage-level mutual-exclusion token. `resource` is unique per live lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub id: String,
    pub resource: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub owner: String,
}

impl Lock {
    pub fn new(resource: &str, owner: &str, now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            resource: resource.to_string(),
            acquired_at: now,
            expires_at: ttl.map(|t| now + t),
            owner: owner.to_string(),
        }
    }
}
