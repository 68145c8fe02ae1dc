//! Per-run artifact directories.
//!
//! ```text
//! <root>/<jobId>/<YYYYMMDDTHHMMSSZ>_<runId>/
//!     metadata.json   stdout.log   steps.json?   report.md
//!     snapshots/      cleaned/     diffs/
//! ```

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use recur_core::time::{compact_ts, fmt_ts};
use recur_core::{JobDefinition, ResourceLimits, ResourceUsage, RunEvent, RunMetadata, RunState, RunTrigger};
use serde::Serialize;

pub const SUBDIRS: [&str; 3] = ["snapshots", "cleaned", "diffs"];

/// Root under which every run gets its own directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, job_id: &str, run_id: &str, at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(job_id)
            .join(format!("{}_{}", compact_ts(at), run_id))
    }

    /// Create the run directory and its fixed subdirectories.
    pub fn create(&self, job_id: &str, run_id: &str, at: DateTime<Utc>) -> io::Result<RunArtifacts> {
        let dir = self.run_dir(job_id, run_id, at);
        for sub in SUBDIRS {
            fs::create_dir_all(dir.join(sub))?;
        }
        Ok(RunArtifacts { dir })
    }

    /// Locate an existing run directory without knowing its timestamp.
    pub fn find(&self, job_id: &str, run_id: &str) -> Option<PathBuf> {
        let suffix = format!("_{run_id}");
        fs::read_dir(self.root.join(job_id))
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix))
            })
    }
}

/// Writer for one run's directory.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn write_metadata(&self, meta: &RunManifest<'_>) -> io::Result<()> {
        fs::write(self.dir.join("metadata.json"), serde_json::to_vec_pretty(meta)?)
    }

    /// `stdout.log`: one line per run event, in event order.
    pub fn write_stdout_log(&self, events: &[RunEvent]) -> io::Result<()> {
        let mut log = String::new();
        for event in events {
            log.push_str(&event.log_line());
            log.push('\n');
        }
        fs::write(self.dir.join("stdout.log"), log)
    }

    pub fn write_steps(&self, steps: &serde_json::Value) -> io::Result<()> {
        fs::write(self.dir.join("steps.json"), serde_json::to_vec_pretty(steps)?)
    }

    pub fn write_report(&self, report: &str) -> io::Result<()> {
        fs::write(self.dir.join("report.md"), report)
    }
}

/// Contents of `metadata.json`. Echoes the job's graph, inputs and caps
/// verbatim next to the run's timing and outcome.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest<'a> {
    pub job_id: &'a str,
    pub run_id: &'a str,
    pub graph_id: &'a str,
    pub job_name: &'a str,
    pub job_version: u32,
    pub attempt: u32,
    pub trigger: RunTrigger,
    pub state: RunState,
    pub dry_run: bool,
    pub executor: &'a str,
    pub inputs: &'a serde_json::Map<String, serde_json::Value>,
    pub resources: &'a ResourceLimits,
    pub timing: Timing,
    pub resource_usage: ResourceUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub scheduled_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: u64,
}

impl<'a> RunManifest<'a> {
    pub fn new(job: &'a JobDefinition, run: &'a RunMetadata, executor: &'a str) -> Self {
        Self {
            job_id: &job.id,
            run_id: &run.id,
            graph_id: &job.graph_id,
            job_name: &job.name,
            job_version: job.version,
            attempt: run.attempt,
            trigger: run.trigger,
            state: run.state,
            dry_run: run.trigger == RunTrigger::Dry,
            executor,
            inputs: run.effective_inputs(job),
            resources: &job.resources,
            timing: Timing {
                scheduled_at: fmt_ts(run.scheduled_at),
                started_at: run.started_at.map(fmt_ts),
                completed_at: run.completed_at.map(fmt_ts),
                duration_ms: run.resource_usage.duration_ms,
            },
            resource_usage: run.resource_usage,
            error_code: run.error_code.as_deref(),
            error_message: run.error_message.as_deref(),
            output_hash: run.output_hash.as_deref(),
        }
    }
}

/// Human-readable `report.md`.
pub fn render_report(job: &JobDefinition, run: &RunMetadata, output: Option<&str>) -> String {
    let mut md = String::new();
    let usage = &run.resource_usage;
    let caps = &job.resources;

    let _ = writeln!(md, "# {}\n", job.name);
    let _ = writeln!(md, "- **Job:** `{}` (v{})", job.id, job.version);
    let _ = writeln!(md, "- **Run:** `{}`", run.id);
    let _ = writeln!(md, "- **Graph:** `{}`", job.graph_id);
    let _ = writeln!(md, "- **State:** {}", run.state);
    let _ = writeln!(md, "- **Trigger:** {} (attempt {})", run.trigger.as_str(), run.attempt);
    let _ = writeln!(md, "- **Scheduled:** {}", fmt_ts(run.scheduled_at));
    if let Some(started) = run.started_at {
        let _ = writeln!(md, "- **Started:** {}", fmt_ts(started));
    }
    if let Some(completed) = run.completed_at {
        let _ = writeln!(md, "- **Completed:** {}", fmt_ts(completed));
    }

    let _ = writeln!(md, "\n## Resources\n");
    let _ = writeln!(md, "| | used | cap |\n|---|---|---|");
    let _ = writeln!(md, "| duration (ms) | {} | {} |", usage.duration_ms, caps.max_run_seconds * 1000);
    let _ = writeln!(md, "| steps | {} | {} |", usage.steps, caps.max_steps);
    let _ = writeln!(md, "| tokens | {} | {} |", usage.tokens, caps.max_model_tokens);
    let bandwidth_cap = caps
        .max_bandwidth_bytes
        .map_or_else(|| "none".to_string(), |b| b.to_string());
    let _ = writeln!(md, "| bandwidth (bytes) | {} | {} |", usage.bandwidth_bytes, bandwidth_cap);

    if let Some(code) = &run.error_code {
        let _ = writeln!(md, "\n## Error\n");
        let _ = writeln!(md, "`{code}`: {}", run.error_message.as_deref().unwrap_or(""));
    }

    if run.trigger == RunTrigger::Dry {
        let _ = writeln!(md, "\n## Dry run\n");
        let _ = writeln!(
            md,
            "The executor was not invoked. A real run would have executed graph `{}` with these inputs and caps:\n",
            job.graph_id
        );
        let plan = serde_json::json!({
            "graphId": job.graph_id,
            "inputs": run.effective_inputs(job),
            "resources": caps,
        });
        let pretty = serde_json::to_string_pretty(&plan).unwrap_or_default();
        let _ = writeln!(md, "```json\n{pretty}\n```");
    }

    if let Some(text) = output {
        let _ = writeln!(md, "\n## Output\n\n{text}");
    }
    md
}
