use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use recur_core::config::ExecutorConfig;
use recur_core::ResourceLimits;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::network::NetworkGate;

/// Everything an executor gets for one invocation.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub run_id: String,
    pub job_id: String,
    pub graph_id: String,
    /// Opaque, passed through unchanged.
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub artifacts_dir: PathBuf,
    /// Advisory caps. Only `max_run_seconds` is enforced by the runner.
    pub limits: ResourceLimits,
    pub attempt: u32,
    /// Network scope, allowlist and per-domain rate limits for this run.
    pub network: Arc<NetworkGate>,
    /// Fired on timeout or when the run is cancelled by a newer one.
    pub cancel: CancellationToken,
}

/// What an executor reports back on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub output: String,
    pub steps_used: u64,
    pub tokens_used: u64,
    pub bandwidth_bytes: u64,
    /// Optional step trace, persisted as `steps.json`.
    pub steps: Option<serde_json::Value>,
    /// Free-form diagnostic lines (e.g. a child's stderr), recorded as events.
    pub diagnostics: Vec<String>,
}

impl ExecutionOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

/// The external capability that does a job's actual work.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor name for logging and run events.
    fn name(&self) -> &str;

    /// Run `request.graph_id` with `request.inputs`. Implementations should
    /// stop promptly once `request.cancel` fires; the runner stops waiting
    /// at the wall-clock cap either way.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Network access denied: {0}")]
    NetworkDenied(String),

    #[error("Rate limited on {host}")]
    RateLimited { host: String },

    #[error("Bandwidth cap of {limit} bytes exceeded")]
    BandwidthExceeded { limit: u64 },

    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid executor response: {0}")]
    Protocol(String),

    #[error("no executor configured (set executor.command)")]
    Unconfigured,

    #[error("operation cancelled")]
    Cancelled,

    /// Failure reported by the executor itself with its own code.
    #[error("{code}: {message}")]
    Failed { code: String, message: String },
}

impl ExecutorError {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutorError::Failed {
            code: code.into().to_ascii_uppercase(),
            message: message.into(),
        }
    }

    /// Stable code persisted as the run's `errorCode` and matched against
    /// `retry.retryableCodes`.
    pub fn code(&self) -> String {
        match self {
            ExecutorError::Timeout { .. } => "TIMEOUT".into(),
            ExecutorError::Network(_) => "NETWORK".into(),
            ExecutorError::NetworkDenied(_) => "NETWORK_DENIED".into(),
            ExecutorError::RateLimited { .. } => "RATE_LIMITED".into(),
            ExecutorError::BandwidthExceeded { .. } => "BANDWIDTH_EXCEEDED".into(),
            ExecutorError::Unavailable(_) => "UNAVAILABLE".into(),
            ExecutorError::Io(_) => "IO_ERROR".into(),
            ExecutorError::Protocol(_) => "PROTOCOL_ERROR".into(),
            ExecutorError::Unconfigured => "EXECUTOR_UNCONFIGURED".into(),
            ExecutorError::Cancelled => "CANCELLED".into(),
            ExecutorError::Failed { code, .. } => code.clone(),
        }
    }
}

/// Stand-in used when no executor command is configured. Every call fails
/// with a non-retryable `EXECUTOR_UNCONFIGURED`.
pub struct UnconfiguredExecutor;

#[async_trait]
impl Executor for UnconfiguredExecutor {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        Err(ExecutorError::Unconfigured)
    }
}

// ---------------------------------------------------------------------------
// External process adapter
// ---------------------------------------------------------------------------

/// Exit status conventionally meaning "temporary failure, try again".
const EX_TEMPFAIL: i32 = 75;
const MAX_DIAGNOSTIC_LINES: usize = 200;

/// Runs a configured command per invocation. The request goes to the
/// child's stdin as one JSON document; stdout is either a JSON response
/// (`{output, stepsUsed, tokensUsed, bandwidthBytes?, steps?}` or
/// `{error: {code, message}}`) or plain text taken as the output. The
/// child is killed when the call is cancelled or times out.
pub struct ProcessExecutor {
    command: String,
    args: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    run_id: &'a str,
    job_id: &'a str,
    graph_id: &'a str,
    inputs: &'a serde_json::Map<String, serde_json::Value>,
    artifacts_dir: &'a std::path::Path,
    resources: &'a ResourceLimits,
    attempt: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    steps_used: u64,
    #[serde(default)]
    tokens_used: u64,
    #[serde(default)]
    bandwidth_bytes: u64,
    #[serde(default)]
    steps: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    code: String,
    #[serde(default)]
    message: String,
}

impl ProcessExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// The configured process adapter, or [`UnconfiguredExecutor`].
    pub fn from_config(config: &ExecutorConfig) -> Arc<dyn Executor> {
        match config.command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => Arc::new(Self::new(cmd, config.args.clone())),
            _ => Arc::new(UnconfiguredExecutor),
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &str {
        &self.command
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        let payload = serde_json::to_vec(&WireRequest {
            run_id: &request.run_id,
            job_id: &request.job_id,
            graph_id: &request.graph_id,
            inputs: &request.inputs,
            artifacts_dir: &request.artifacts_dir,
            resources: &request.limits,
            attempt: request.attempt,
        })
        .map_err(|e| ExecutorError::Protocol(e.to_string()))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("RECUR_RUN_ID", &request.run_id)
            .env("RECUR_JOB_ID", &request.job_id)
            .env("RECUR_GRAPH_ID", &request.graph_id)
            .env("RECUR_ARTIFACTS_DIR", &request.artifacts_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Unavailable(format!("spawn {}: {e}", self.command)))?;
        debug!(command = %self.command, pid = ?child.id(), "executor process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            // A child that never reads its stdin is not an error.
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }

        // Dropping the wait future on cancellation drops the child, which
        // kills it (`kill_on_drop`).
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = request.cancel.cancelled() => return Err(ExecutorError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics: Vec<String> = stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .take(MAX_DIAGNOSTIC_LINES)
            .map(str::to_string)
            .collect();
        let response = parse_response(&stdout);

        if let Some(WireResponse {
            error: Some(err), ..
        }) = &response
        {
            return Err(ExecutorError::failed(&err.code, &err.message));
        }

        if !output.status.success() {
            let tail = diagnostics.last().cloned().unwrap_or_default();
            return Err(match output.status.code() {
                Some(EX_TEMPFAIL) => ExecutorError::Unavailable(tail),
                Some(code) => ExecutorError::failed(
                    "EXECUTOR_FAILED",
                    format!("exit status {code}: {tail}"),
                ),
                None => ExecutorError::failed("EXECUTOR_FAILED", "terminated by signal"),
            });
        }

        Ok(match response {
            Some(r) => ExecutionOutput {
                output: r.output.unwrap_or_default(),
                steps_used: r.steps_used,
                tokens_used: r.tokens_used,
                bandwidth_bytes: r.bandwidth_bytes,
                steps: r.steps,
                diagnostics,
            },
            None => ExecutionOutput {
                output: stdout.trim_end().to_string(),
                diagnostics,
                ..Default::default()
            },
        })
    }
}

/// JSON response if stdout is one, else `None` (plain-text output).
fn parse_response(stdout: &str) -> Option<WireResponse> {
    let trimmed = stdout.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<WireResponse>(trimmed)
        .ok()
        .filter(|r| r.output.is_some() || r.error.is_some())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use recur_store::Store;
    use std::time::{Duration, Instant};

    fn request(dir: &std::path::Path) -> ExecutionRequest {
        let store = Arc::new(Store::open_in_memory().unwrap());
        ExecutionRequest {
            run_id: "run-1".into(),
            job_id: "job-1".into(),
            graph_id: "digest".into(),
            inputs: serde_json::Map::new(),
            artifacts_dir: dir.to_path_buf(),
            limits: ResourceLimits::default(),
            attempt: 0,
            network: Arc::new(NetworkGate::new(store, "job-1", "run-1", &ResourceLimits::default())),
            cancel: CancellationToken::new(),
        }
    }

    fn sh(script: &str) -> ProcessExecutor {
        ProcessExecutor::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn json_response_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let exec = sh(r#"cat >/dev/null; echo '{"output":"done","stepsUsed":3,"tokensUsed":120}'"#);
        let out = exec.execute(&request(dir.path())).await.unwrap();
        assert_eq!(out.output, "done");
        assert_eq!(out.steps_used, 3);
        assert_eq!(out.tokens_used, 120);
    }

    #[tokio::test]
    async fn plain_text_stdout_is_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = sh("echo hello; echo world")
            .execute(&request(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.output, "hello\nworld");
    }

    #[tokio::test]
    async fn request_arrives_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = sh("cat").execute(&request(dir.path())).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&out.output).unwrap();
        assert_eq!(echoed["graphId"], "digest");
        assert_eq!(echoed["resources"]["maxRunSeconds"], 300);
    }

    #[tokio::test]
    async fn reported_error_keeps_its_code() {
        let dir = tempfile::tempdir().unwrap();
        let err = sh(r#"echo '{"error":{"code":"network","message":"dns"}}'; exit 1"#)
            .execute(&request(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NETWORK");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = sh("echo boom >&2; exit 3")
            .execute(&request(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXECUTOR_FAILED");
        assert!(err.to_string().contains("boom"));

        let temp = sh("exit 75").execute(&request(dir.path())).await.unwrap_err();
        assert_eq!(temp.code(), "UNAVAILABLE");
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let err = sh("sleep 30").execute(&req).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_command_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessExecutor::new("/nonexistent/recur-executor", vec![])
            .execute(&request(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
    }

    #[test]
    fn blank_command_means_unconfigured() {
        let exec = ProcessExecutor::from_config(&ExecutorConfig {
            command: Some("  ".into()),
            args: vec![],
        });
        assert_eq!(exec.name(), "unconfigured");
    }
}
