use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use recur_core::{EventLevel, JobDefinition, RunMetadata, RunState, RunTrigger};
use recur_scheduler::{Admission, Scheduler};
use recur_store::Store;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::artifacts::{render_report, ArtifactStore, RunArtifacts, RunManifest};
use crate::error::{Result, RunnerError};
use crate::executor::{ExecutionOutput, ExecutionRequest, Executor, ExecutorError};
use crate::network::NetworkGate;
use crate::retry::{self, RetryDecision};

pub const ADMISSION_REJECTED: &str = "ADMISSION_REJECTED";
pub const ABANDONED: &str = "ABANDONED";

/// Drives runs through `DUE → STARTING → RUNNING → outcome`.
///
/// The executor is injected and is the only suspension point. Everything
/// the runner decides is written to the store before it returns, so a
/// restarted process resumes from rows alone.
pub struct Runner {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    executor: Arc<dyn Executor>,
    artifacts: ArtifactStore,
    /// Runs executing in this process, by run id.
    in_flight: DashMap<String, CancellationToken>,
}

impl Runner {
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        executor: Arc<dyn Executor>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            store,
            scheduler,
            executor,
            artifacts,
            in_flight: DashMap::new(),
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Fire the cancellation token of a run executing in this process.
    pub fn signal_cancel(&self, run_id: &str) -> bool {
        match self.in_flight.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // --- entry points --------------------------------------------------------

    /// Execute one DUE run to completion. Returns the run as persisted.
    ///
    /// Deferred `queue` runs come back still DUE; rejected runs come back
    /// FAILED without touching the executor.
    #[instrument(skip(self))]
    pub async fn execute_run(&self, run_id: &str) -> Result<RunMetadata> {
        let run = self.store.get_run(run_id)?.ok_or_else(|| RunnerError::RunNotFound {
            id: run_id.to_string(),
        })?;
        let job = self.store.get_job(&run.job_id)?.ok_or_else(|| RunnerError::JobNotFound {
            id: run.job_id.clone(),
        })?;
        if run.state != RunState::Due
            || !self
                .store
                .transition_run(run_id, &[RunState::Due], RunState::Starting, None)?
        {
            let state = self.store.get_run(run_id)?.map_or(run.state, |r| r.state);
            return Err(RunnerError::NotDue {
                id: run_id.to_string(),
                state,
            });
        }
        let mut run = RunMetadata {
            state: RunState::Starting,
            ..run
        };

        let admission = match self.scheduler.can_run_job(&job, run_id) {
            Ok(a) => a,
            Err(e) => {
                self.store
                    .transition_run(run_id, &[RunState::Starting], RunState::Due, None)?;
                return Err(e.into());
            }
        };
        let cancelled = match admission {
            Admission::Admitted { cancelled } => cancelled,
            Admission::Deferred { reason } => {
                self.store
                    .transition_run(run_id, &[RunState::Starting], RunState::Due, None)?;
                debug!(job_id = %job.id, %reason, "run deferred");
                run.state = RunState::Due;
                return Ok(run);
            }
            Admission::Rejected { reason } => return self.reject(&job, run, &reason),
        };
        for victim in &cancelled {
            if self.signal_cancel(victim) {
                debug!(victim = %victim, "signalled superseded run");
            }
        }

        let _lock = LockGuard {
            store: &self.store,
            resource: job.concurrency.requires_lock().then(|| job.id.clone()),
            owner: run_id,
        };

        let started = Utc::now();
        if !self.scheduler.mark_run_started(run_id, started)? {
            // Cancelled between admission and start.
            return Ok(self.store.require_run(run_id)?);
        }
        run.state = RunState::Running;
        run.started_at = Some(started);
        self.event(
            run_id,
            EventLevel::Info,
            "run.started",
            &format!("attempt {} of job {}", run.attempt, job.id),
            Some(json!({
                "attempt": run.attempt,
                "graphId": job.graph_id,
                "executor": self.executor.name(),
                "maxRunSeconds": job.resources.max_run_seconds,
            })),
        )?;

        let (dir, outcome) = match self.artifacts.create(&job.id, run_id, started) {
            Ok(dir) => {
                let outcome = self.invoke(&job, &run, &dir).await;
                (Some(dir), outcome)
            }
            Err(e) => (None, Err(ExecutorError::Io(e))),
        };

        let completed = Utc::now();
        let current = self.store.require_run(run_id)?;
        if current.state == RunState::Cancelled {
            info!(job_id = %job.id, run_id, "run was cancelled; outcome discarded");
            return Ok(current);
        }

        run.completed_at = Some(completed);
        run.resource_usage.duration_ms = (completed - started).num_milliseconds().max(0) as u64;
        match outcome {
            Ok(output) => self.succeed(&job, run, dir.as_ref(), output),
            Err(err) => self.fail(&job, run, dir.as_ref(), err),
        }
    }

    /// Create a manual run at now (optionally with replacement inputs) and
    /// execute it immediately.
    pub async fn run_job_now(
        &self,
        job_id: &str,
        inputs: Option<serde_json::Map<String, Value>>,
    ) -> Result<RunMetadata> {
        let job = self.require_job(job_id)?;
        let mut run = RunMetadata::new_due(&job.id, Utc::now(), 0, RunTrigger::Manual);
        run.inputs_override = inputs;
        self.store.upsert_run(&run)?;
        self.event(
            &run.id,
            EventLevel::Info,
            "run.created",
            "manual trigger",
            Some(json!({ "inputsOverridden": run.inputs_override.is_some() })),
        )?;
        info!(job_id, run_id = %run.id, "manual run created");
        self.execute_run(&run.id).await
    }

    /// Walk the artifact and state machinery without invoking the executor.
    /// Takes no lock and leaves the schedule alone.
    #[instrument(skip(self))]
    pub fn dry_run(&self, job_id: &str) -> Result<RunMetadata> {
        let job = self.require_job(job_id)?;
        let started = Utc::now();
        // Inserted already RUNNING so no poller can claim it as due.
        let mut run = RunMetadata {
            state: RunState::Running,
            started_at: Some(started),
            ..RunMetadata::new_due(&job.id, started, 0, RunTrigger::Dry)
        };
        self.store.upsert_run(&run)?;
        self.event(
            &run.id,
            EventLevel::Info,
            "run.started",
            "dry run: executor will not be invoked",
            Some(json!({ "graphId": job.graph_id })),
        )?;

        let dir = match self.artifacts.create(&job.id, &run.id, started) {
            Ok(dir) => dir,
            Err(e) => {
                run.state = RunState::Failed;
                run.completed_at = Some(Utc::now());
                run.error_code = Some("IO_ERROR".to_string());
                run.error_message = Some(e.to_string());
                self.store.finish_run(&run)?;
                self.event(&run.id, EventLevel::Error, "run.failed", &e.to_string(), None)?;
                return Err(RunnerError::Io(e));
            }
        };

        let completed = Utc::now();
        run.state = RunState::Succeeded;
        run.completed_at = Some(completed);
        run.resource_usage.duration_ms = (completed - started).num_milliseconds().max(0) as u64;
        self.store.finish_run(&run)?;
        self.event(&run.id, EventLevel::Info, "run.succeeded", "dry run complete", None)?;
        self.write_artifacts(&job, &run, &dir, None, None);
        info!(job_id, run_id = %run.id, "dry run complete");
        Ok(run)
    }

    /// Finalize STARTING/RUNNING runs left behind by a process that died:
    /// not in flight here and older than their lock lifetime. Returns how
    /// many were finalized.
    pub fn reconcile_abandoned(&self, now: DateTime<Utc>) -> Result<usize> {
        let grace = Duration::seconds(self.scheduler.config().lock_grace_secs as i64);
        let mut reconciled = 0;
        for mut run in self.store.stale_runs(now - grace)? {
            if self.in_flight.contains_key(&run.id) {
                continue;
            }
            let Some(job) = self.store.get_job(&run.job_id)? else {
                continue;
            };
            let since = run.started_at.unwrap_or(run.scheduled_at);
            if now - since < self.scheduler.lock_ttl(&job) {
                continue;
            }
            run.state = RunState::Failed;
            run.completed_at = Some(now);
            run.error_code = Some(ABANDONED.to_string());
            run.error_message = Some("run outlived its lock without finishing".to_string());
            if !self.store.finish_run(&run)? {
                continue;
            }
            self.event(
                &run.id,
                EventLevel::Error,
                "run.abandoned",
                "run outlived its lock without finishing",
                Some(json!({ "since": recur_core::time::fmt_ts(since) })),
            )?;
            self.store.release_locks_owned_by(&run.id)?;
            self.scheduler.record_run_outcome(&job.id, false, now)?;
            warn!(job_id = %job.id, run_id = %run.id, "abandoned run finalized");
            reconciled += 1;
        }
        Ok(reconciled)
    }

    // --- execution -----------------------------------------------------------

    /// Call the executor under the wall-clock cap. Cancellation (timeout or
    /// a newer run under `cancel-previous`) drops the executor future.
    async fn invoke(
        &self,
        job: &JobDefinition,
        run: &RunMetadata,
        dir: &RunArtifacts,
    ) -> std::result::Result<ExecutionOutput, ExecutorError> {
        let cancel = CancellationToken::new();
        let _in_flight = InFlight::register(&self.in_flight, &run.id, cancel.clone());

        let request = ExecutionRequest {
            run_id: run.id.clone(),
            job_id: job.id.clone(),
            graph_id: job.graph_id.clone(),
            inputs: run.effective_inputs(job).clone(),
            artifacts_dir: dir.path().to_path_buf(),
            limits: job.resources.clone(),
            attempt: run.attempt,
            network: Arc::new(NetworkGate::new(
                Arc::clone(&self.store),
                &job.id,
                &run.id,
                &job.resources,
            )),
            cancel: cancel.clone(),
        };

        let seconds = job.resources.max_run_seconds;
        let result = tokio::select! {
            r = tokio::time::timeout(StdDuration::from_secs(seconds), self.executor.execute(&request)) => {
                r.unwrap_or(Err(ExecutorError::Timeout { seconds }))
            }
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        };
        // Cooperative executors may still hold the token.
        cancel.cancel();

        result.map(|mut out| {
            out.bandwidth_bytes = out.bandwidth_bytes.max(request.network.bandwidth_used());
            out
        })
    }

    fn succeed(
        &self,
        job: &JobDefinition,
        mut run: RunMetadata,
        dir: Option<&RunArtifacts>,
        output: ExecutionOutput,
    ) -> Result<RunMetadata> {
        let hash = hex::encode(Sha256::digest(output.output.as_bytes()));
        run.state = RunState::Succeeded;
        run.output_hash = Some(hash.clone());
        run.resource_usage.steps = output.steps_used;
        run.resource_usage.tokens = output.tokens_used;
        run.resource_usage.bandwidth_bytes = output.bandwidth_bytes;

        self.record_diagnostics(&run.id, &output.diagnostics)?;
        let previous = self.store.last_output_hash(&job.id, &run.id)?;
        if !self.store.finish_run(&run)? {
            return Ok(self.store.require_run(&run.id)?);
        }
        self.event(
            &run.id,
            EventLevel::Info,
            "run.succeeded",
            "executor finished",
            Some(json!({
                "durationMs": run.resource_usage.duration_ms,
                "steps": run.resource_usage.steps,
                "tokens": run.resource_usage.tokens,
                "outputHash": hash,
            })),
        )?;
        if let Some(completed) = run.completed_at {
            self.scheduler.record_run_outcome(&job.id, true, completed)?;
        }

        let material_change = previous.is_some_and(|p| p != hash);
        self.alerts(job, &run, material_change)?;
        if let Some(dir) = dir {
            self.write_artifacts(job, &run, dir, Some(&output.output), output.steps.as_ref());
        }
        info!(job_id = %job.id, run_id = %run.id, duration_ms = run.resource_usage.duration_ms, "run succeeded");
        Ok(run)
    }

    fn fail(
        &self,
        job: &JobDefinition,
        mut run: RunMetadata,
        dir: Option<&RunArtifacts>,
        err: ExecutorError,
    ) -> Result<RunMetadata> {
        let completed = run.completed_at.unwrap_or_else(Utc::now);
        run.completed_at = Some(completed);
        let code = err.code();
        let message = err.to_string();
        let decision = retry::decide(&job.retry, run.attempt, &code, completed);
        run.state = match decision {
            RetryDecision::Retry { .. } => RunState::FailedRetryable,
            RetryDecision::GiveUp { .. } => RunState::Failed,
        };
        run.error_code = Some(code.clone());
        run.error_message = Some(message.clone());

        if !self.store.finish_run(&run)? {
            return Ok(self.store.require_run(&run.id)?);
        }
        self.event(
            &run.id,
            EventLevel::Error,
            "run.failed",
            &message,
            Some(json!({ "code": code, "attempt": run.attempt, "state": run.state })),
        )?;

        match decision {
            RetryDecision::Retry { attempt, at, delay_ms } => {
                let mut next = RunMetadata::new_due(&job.id, at, attempt, RunTrigger::Retry);
                next.inputs_override = run.inputs_override.clone();
                self.store.upsert_run(&next)?;
                self.event(
                    &next.id,
                    EventLevel::Info,
                    "run.scheduled",
                    &format!("retry of run {}", run.id),
                    Some(json!({ "previousRunId": run.id, "attempt": attempt })),
                )?;
                self.event(
                    &run.id,
                    EventLevel::Info,
                    "retry.scheduled",
                    &format!("attempt {attempt} in {delay_ms} ms"),
                    Some(json!({
                        "nextRunId": next.id,
                        "attempt": attempt,
                        "delayMs": delay_ms,
                        "scheduledAt": recur_core::time::fmt_ts(at),
                    })),
                )?;
                warn!(job_id = %job.id, run_id = %run.id, %code, attempt, delay_ms, "run failed, retry scheduled");
            }
            RetryDecision::GiveUp { retryable } => {
                if retryable {
                    self.event(
                        &run.id,
                        EventLevel::Warn,
                        "retry.exhausted",
                        &format!("no retries left after {} attempts", run.attempt + 1),
                        None,
                    )?;
                }
                warn!(job_id = %job.id, run_id = %run.id, %code, "run failed");
            }
        }

        self.scheduler.record_run_outcome(&job.id, false, completed)?;
        self.alerts(job, &run, false)?;
        if let Some(dir) = dir {
            self.write_artifacts(job, &run, dir, None, None);
        }
        Ok(run)
    }

    /// Admission said no: record a terminal FAILED run with the reason.
    fn reject(&self, job: &JobDefinition, mut run: RunMetadata, reason: &str) -> Result<RunMetadata> {
        let now = Utc::now();
        self.event(
            &run.id,
            EventLevel::Warn,
            "run.rejected",
            reason,
            Some(json!({ "policy": job.concurrency.as_str() })),
        )?;
        run.state = RunState::Failed;
        run.completed_at = Some(now);
        run.error_code = Some(ADMISSION_REJECTED.to_string());
        run.error_message = Some(reason.to_string());
        if !self.store.finish_run(&run)? {
            return Ok(self.store.require_run(&run.id)?);
        }
        self.scheduler.record_run_outcome(&job.id, false, now)?;
        warn!(job_id = %job.id, run_id = %run.id, %reason, "run rejected by admission control");
        Ok(run)
    }

    // --- helpers -------------------------------------------------------------

    fn require_job(&self, job_id: &str) -> Result<JobDefinition> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| RunnerError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    fn event(
        &self,
        run_id: &str,
        level: EventLevel,
        event: &str,
        message: &str,
        data: Option<Value>,
    ) -> Result<()> {
        self.store.append_event(run_id, level, event, message, data)?;
        Ok(())
    }

    fn record_diagnostics(&self, run_id: &str, lines: &[String]) -> Result<()> {
        for line in lines {
            self.event(run_id, EventLevel::Debug, "executor.stderr", line, None)?;
        }
        Ok(())
    }

    fn alerts(&self, job: &JobDefinition, run: &RunMetadata, material_change: bool) -> Result<()> {
        let alerts = &job.alerts;
        if run.state == RunState::Succeeded && alerts.on_success {
            self.event(&run.id, EventLevel::Info, "alert.success", &format!("{} succeeded", job.name), None)?;
            info!(job_id = %job.id, run_id = %run.id, alert = "success", "alert");
        }
        if run.state == RunState::Failed && alerts.on_failure {
            let message = run.error_message.as_deref().unwrap_or("run failed");
            self.event(&run.id, EventLevel::Error, "alert.failure", message, None)?;
            warn!(job_id = %job.id, run_id = %run.id, alert = "failure", "alert");
        }
        if material_change && alerts.on_material_change {
            self.event(
                &run.id,
                EventLevel::Info,
                "alert.material_change",
                "output differs from the previous successful run",
                None,
            )?;
            info!(job_id = %job.id, run_id = %run.id, alert = "material_change", "alert");
        }
        Ok(())
    }

    /// Best effort: a failed artifact write is logged and recorded but never
    /// changes the run's outcome. `stdout.log` goes last so it holds every
    /// event written so far.
    fn write_artifacts(
        &self,
        job: &JobDefinition,
        run: &RunMetadata,
        dir: &RunArtifacts,
        output: Option<&str>,
        steps: Option<&Value>,
    ) {
        let result = (|| -> Result<()> {
            dir.write_metadata(&RunManifest::new(job, run, self.executor.name()))?;
            if let Some(steps) = steps {
                dir.write_steps(steps)?;
            }
            dir.write_report(&render_report(job, run, output))?;
            dir.write_stdout_log(&self.store.list_events(&run.id)?)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(run_id = %run.id, "artifact write failed: {e}");
            let _ = self.event(&run.id, EventLevel::Warn, "artifacts.failed", &e.to_string(), None);
        }
    }
}

/// Releases the job lock on every exit path of `execute_run`.
struct LockGuard<'a> {
    store: &'a Store,
    resource: Option<String>,
    owner: &'a str,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(resource) = &self.resource {
            match self.store.release_lock(resource, self.owner) {
                Ok(true) => debug!(%resource, owner = self.owner, "lock released"),
                // Superseded under cancel-previous, or expired and taken over.
                Ok(false) => {}
                Err(e) => warn!(%resource, owner = self.owner, "lock release failed: {e}"),
            }
        }
    }
}

/// Registry entry for a run executing in this process.
struct InFlight<'a> {
    map: &'a DashMap<String, CancellationToken>,
    run_id: String,
}

impl<'a> InFlight<'a> {
    fn register(map: &'a DashMap<String, CancellationToken>, run_id: &str, token: CancellationToken) -> Self {
        map.insert(run_id.to_string(), token);
        Self {
            map,
            run_id: run_id.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::UnconfiguredExecutor;
    use async_trait::async_trait;
    use recur_core::config::SchedulerConfig;
    use recur_core::{ConcurrencyPolicy, Lock, RetryPolicy, RetryStrategy};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Plays back queued results, then succeeds with "ok".
    #[derive(Default)]
    struct Scripted {
        results: Mutex<VecDeque<std::result::Result<ExecutionOutput, ExecutorError>>>,
        inputs: Mutex<Vec<serde_json::Map<String, Value>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn with(results: Vec<std::result::Result<ExecutionOutput, ExecutorError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Executor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, request: &ExecutionRequest) -> std::result::Result<ExecutionOutput, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(request.inputs.clone());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ExecutionOutput::text("ok")))
        }
    }

    /// First call blocks until cancelled; later calls succeed.
    #[derive(Default)]
    struct BlockFirst {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for BlockFirst {
        fn name(&self) -> &str {
            "block-first"
        }

        async fn execute(&self, request: &ExecutionRequest) -> std::result::Result<ExecutionOutput, ExecutorError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                request.cancel.cancelled().await;
                return Err(ExecutorError::Cancelled);
            }
            Ok(ExecutionOutput::text("second"))
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<Store>,
        runner: Arc<Runner>,
    }

    fn fixture(executor: Arc<dyn Executor>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), SchedulerConfig::default()));
        let runner = Arc::new(Runner::new(
            Arc::clone(&store),
            scheduler,
            executor,
            ArtifactStore::new(tmp.path()),
        ));
        Fixture { _tmp: tmp, store, runner }
    }

    fn job(id: &str, concurrency: ConcurrencyPolicy) -> JobDefinition {
        JobDefinition {
            id: id.into(),
            name: id.into(),
            schedule: "0 * * * *".into(),
            graph_id: "g".into(),
            concurrency,
            inputs: json!({"q": "default"}).as_object().cloned().unwrap(),
            ..Default::default()
        }
    }

    fn due_run(store: &Store, job_id: &str) -> RunMetadata {
        let run = RunMetadata::new_due(job_id, Utc::now(), 0, RunTrigger::Scheduled);
        store.upsert_run(&run).unwrap();
        run
    }

    fn events(store: &Store, run_id: &str) -> Vec<String> {
        store
            .list_events(run_id)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    #[tokio::test]
    async fn successful_run_writes_every_artifact() {
        let exec = Arc::new(Scripted::with(vec![Ok(ExecutionOutput {
            output: "all good".into(),
            steps_used: 4,
            tokens_used: 900,
            steps: Some(json!([{"step": 1}])),
            ..Default::default()
        })]));
        let fx = fixture(exec);
        let j = job("ok", ConcurrencyPolicy::Skip);
        fx.store.upsert_job(&j).unwrap();
        let run = due_run(&fx.store, "ok");

        let done = fx.runner.execute_run(&run.id).await.unwrap();
        assert_eq!(done.state, RunState::Succeeded);
        assert_eq!(done.resource_usage.steps, 4);
        assert_eq!(done.resource_usage.tokens, 900);
        assert!(done.output_hash.is_some());
        let row = fx.store.require_run(&run.id).unwrap();
        assert_eq!(row.state, RunState::Succeeded);
        assert_eq!(row.output_hash, done.output_hash);

        let dir = fx.runner.artifacts().find("ok", &run.id).unwrap();
        for file in ["metadata.json", "stdout.log", "steps.json", "report.md"] {
            assert!(dir.join(file).is_file(), "missing {file}");
        }
        for sub in ["snapshots", "cleaned", "diffs"] {
            assert!(dir.join(sub).is_dir());
        }
        let meta: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["jobId"], "ok");
        assert_eq!(meta["runId"], run.id.as_str());
        assert_eq!(meta["inputs"]["q"], "default");
        let log = std::fs::read_to_string(dir.join("stdout.log")).unwrap();
        assert!(log.contains("run.started") && log.contains("run.succeeded"));

        assert!(fx.store.get_lock("ok", Utc::now()).unwrap().is_none());
        let sched = fx.store.get_schedule("ok").unwrap();
        assert!(sched.is_none(), "schedule rows are only created by the scheduler");
    }

    #[tokio::test]
    async fn retries_back_off_then_give_up() {
        let timeouts = (0..4).map(|_| Err(ExecutorError::Timeout { seconds: 1 })).collect();
        let fx = fixture(Arc::new(Scripted::with(timeouts)));
        let j = JobDefinition {
            retry: RetryPolicy {
                max_retries: 3,
                strategy: RetryStrategy::Exponential,
                delays: vec![1_000, 5_000, 30_000],
                retryable_codes: vec![],
            },
            ..job("flaky", ConcurrencyPolicy::Allow)
        };
        fx.store.upsert_job(&j).unwrap();
        let mut run_id = due_run(&fx.store, "flaky").id;

        for (attempt, delay) in [(0u32, 1_000i64), (1, 5_000), (2, 30_000)] {
            let failed = fx.runner.execute_run(&run_id).await.unwrap();
            assert_eq!(failed.state, RunState::FailedRetryable);
            assert_eq!(failed.attempt, attempt);
            assert_eq!(failed.error_code.as_deref(), Some("TIMEOUT"));

            let next = fx
                .store
                .list_runs("flaky", 10)
                .unwrap()
                .into_iter()
                .find(|r| r.attempt == attempt + 1)
                .unwrap();
            assert_eq!(next.state, RunState::Due);
            assert_eq!(next.trigger, RunTrigger::Retry);
            assert_eq!(
                next.scheduled_at - failed.completed_at.unwrap(),
                Duration::milliseconds(delay)
            );
            run_id = next.id;
        }

        let last = fx.runner.execute_run(&run_id).await.unwrap();
        assert_eq!(last.state, RunState::Failed);
        assert_eq!(fx.store.list_runs("flaky", 10).unwrap().len(), 4);
        assert!(events(&fx.store, &run_id).contains(&"retry.exhausted".to_string()));
    }

    #[tokio::test]
    async fn skip_rejects_without_touching_the_executor() {
        let exec = Arc::new(Scripted::default());
        let fx = fixture(exec.clone());
        let j = job("busy", ConcurrencyPolicy::Skip);
        fx.store.upsert_job(&j).unwrap();
        let held = Lock::new("busy", "run-a", Utc::now(), Some(Duration::minutes(5)));
        assert!(fx.store.acquire_lock(&held).unwrap());

        let run = due_run(&fx.store, "busy");
        let done = fx.runner.execute_run(&run.id).await.unwrap();
        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.error_message.as_deref(), Some("job already running"));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert!(fx.runner.artifacts().find("busy", &run.id).is_none());
        assert!(events(&fx.store, &run.id).contains(&"run.rejected".to_string()));
        // The holder keeps its lock.
        assert_eq!(fx.store.get_lock("busy", Utc::now()).unwrap().unwrap().owner, "run-a");
    }

    #[tokio::test]
    async fn queue_defers_while_locked() {
        let fx = fixture(Arc::new(Scripted::default()));
        let j = job("line", ConcurrencyPolicy::Queue);
        fx.store.upsert_job(&j).unwrap();
        let held = Lock::new("line", "run-a", Utc::now(), Some(Duration::minutes(5)));
        fx.store.acquire_lock(&held).unwrap();

        let run = due_run(&fx.store, "line");
        let deferred = fx.runner.execute_run(&run.id).await.unwrap();
        assert_eq!(deferred.state, RunState::Due);
        assert_eq!(fx.store.require_run(&run.id).unwrap().state, RunState::Due);

        fx.store.release_lock("line", "run-a").unwrap();
        let done = fx.runner.execute_run(&run.id).await.unwrap();
        assert_eq!(done.state, RunState::Succeeded);
    }

    #[tokio::test]
    async fn timeout_is_a_hard_boundary() {
        struct Sleepy;
        #[async_trait]
        impl Executor for Sleepy {
            fn name(&self) -> &str {
                "sleepy"
            }
            async fn execute(&self, _r: &ExecutionRequest) -> std::result::Result<ExecutionOutput, ExecutorError> {
                tokio::time::sleep(StdDuration::from_secs(60)).await;
                Ok(ExecutionOutput::text("late"))
            }
        }

        let fx = fixture(Arc::new(Sleepy));
        let mut j = job("slow", ConcurrencyPolicy::Skip);
        j.resources.max_run_seconds = 1;
        fx.store.upsert_job(&j).unwrap();
        let run = due_run(&fx.store, "slow");

        let started = std::time::Instant::now();
        let done = fx.runner.execute_run(&run.id).await.unwrap();
        assert!(started.elapsed() < StdDuration::from_secs(10));
        assert_eq!(done.state, RunState::FailedRetryable);
        assert_eq!(done.error_code.as_deref(), Some("TIMEOUT"));
        assert!(fx.store.get_lock("slow", Utc::now()).unwrap().is_none());
        assert_eq!(fx.runner.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_final_and_alerts() {
        let fx = fixture(Arc::new(Scripted::with(vec![Err(ExecutorError::failed(
            "INVALID_INPUT",
            "topic missing",
        ))])));
        fx.store.upsert_job(&job("bad", ConcurrencyPolicy::Allow)).unwrap();
        let run = due_run(&fx.store, "bad");

        let done = fx.runner.execute_run(&run.id).await.unwrap();
        assert_eq!(done.state, RunState::Failed);
        assert_eq!(fx.store.list_runs("bad", 10).unwrap().len(), 1);
        let names = events(&fx.store, &run.id);
        assert!(names.contains(&"alert.failure".to_string()));
        let dir = fx.runner.artifacts().find("bad", &run.id).unwrap();
        assert!(dir.join("metadata.json").is_file());
        assert!(!dir.join("steps.json").exists());
    }

    #[tokio::test]
    async fn unconfigured_executor_fails_without_retry() {
        let fx = fixture(Arc::new(UnconfiguredExecutor));
        fx.store.upsert_job(&job("none", ConcurrencyPolicy::Allow)).unwrap();
        let done = fx.runner.run_job_now("none", None).await.unwrap();
        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.error_code.as_deref(), Some("EXECUTOR_UNCONFIGURED"));
        assert_eq!(fx.store.list_runs("none", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_now_overrides_inputs() {
        let exec = Arc::new(Scripted::default());
        let fx = fixture(exec.clone());
        fx.store.upsert_job(&job("manual", ConcurrencyPolicy::Allow)).unwrap();
        let custom = json!({"q": "custom"}).as_object().cloned().unwrap();

        let done = fx.runner.run_job_now("manual", Some(custom.clone())).await.unwrap();
        assert_eq!(done.state, RunState::Succeeded);
        assert_eq!(done.trigger, RunTrigger::Manual);
        assert_eq!(exec.inputs.lock().unwrap().as_slice(), &[custom]);
        assert!(matches!(
            fx.runner.run_job_now("missing", None).await,
            Err(RunnerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_previous_stops_the_older_run() {
        let fx = fixture(Arc::new(BlockFirst::default()));
        fx.store.upsert_job(&job("cp", ConcurrencyPolicy::CancelPrevious)).unwrap();
        let first = due_run(&fx.store, "cp");

        let runner = Arc::clone(&fx.runner);
        let first_id = first.id.clone();
        let handle = tokio::spawn(async move { runner.execute_run(&first_id).await });
        while fx.store.require_run(&first.id).unwrap().state != RunState::Running
            || fx.runner.in_flight_count() == 0
        {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        let second = due_run(&fx.store, "cp");
        let done = fx.runner.execute_run(&second.id).await.unwrap();
        assert_eq!(done.state, RunState::Succeeded);

        let cancelled = handle.await.unwrap().unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        let dir = fx.runner.artifacts().find("cp", &first.id).unwrap();
        assert!(!dir.join("metadata.json").exists());
        // No retry for a cancelled run.
        assert_eq!(fx.store.list_runs("cp", 10).unwrap().len(), 2);
        assert!(fx.store.get_lock("cp", Utc::now()).unwrap().is_none());
    }

    #[tokio::test]
    async fn material_change_compares_with_the_last_success() {
        let outputs = ["v1", "v2", "v2"]
            .into_iter()
            .map(|o| Ok(ExecutionOutput::text(o)))
            .collect();
        let fx = fixture(Arc::new(Scripted::with(outputs)));
        let mut j = job("watch", ConcurrencyPolicy::Allow);
        j.alerts.on_material_change = true;
        fx.store.upsert_job(&j).unwrap();

        let mut flagged = Vec::new();
        for _ in 0..3 {
            let run = fx.runner.run_job_now("watch", None).await.unwrap();
            flagged.push(events(&fx.store, &run.id).contains(&"alert.material_change".to_string()));
        }
        assert_eq!(flagged, vec![false, true, false]);
    }

    #[test]
    fn dry_run_never_calls_the_executor() {
        let exec = Arc::new(Scripted::default());
        let fx = fixture(exec.clone());
        fx.store.upsert_job(&job("dry", ConcurrencyPolicy::Skip)).unwrap();

        let run = fx.runner.dry_run("dry").unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.trigger, RunTrigger::Dry);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert!(fx.store.get_lock("dry", Utc::now()).unwrap().is_none());
        assert!(fx.store.get_schedule("dry").unwrap().is_none());

        let dir = fx.runner.artifacts().find("dry", &run.id).unwrap();
        let report = std::fs::read_to_string(dir.join("report.md")).unwrap();
        assert!(report.contains("would have executed"));
        let meta: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["dryRun"], true);
    }

    #[test]
    fn dry_run_row_is_never_due() {
        let fx = fixture(Arc::new(Scripted::default()));
        fx.store.upsert_job(&job("dry", ConcurrencyPolicy::Allow)).unwrap();
        // A file where the job's artifact directory belongs.
        let blocker = fx.runner.artifacts().run_dir("dry", "x", Utc::now());
        let job_dir = blocker.parent().unwrap().to_path_buf();
        std::fs::create_dir_all(job_dir.parent().unwrap()).unwrap();
        std::fs::write(&job_dir, b"not a directory").unwrap();

        let err = fx.runner.dry_run("dry").unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(fx.store.due_runs(Utc::now() + Duration::hours(1)).unwrap().is_empty());

        let run = &fx.store.list_runs("dry", 5).unwrap()[0];
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.trigger, RunTrigger::Dry);
        assert!(run.started_at.is_some());
        let names: Vec<_> = events(&fx.store, &run.id);
        assert!(!names.iter().any(|n| n == "run.created"));
        assert_eq!(names.first().map(String::as_str), Some("run.started"));
    }

    #[test]
    fn abandoned_runs_are_finalized_and_unlocked() {
        let fx = fixture(Arc::new(Scripted::default()));
        fx.store.upsert_job(&job("crash", ConcurrencyPolicy::Skip)).unwrap();
        let now = Utc::now();
        let run = RunMetadata::new_due("crash", now - Duration::hours(2), 0, RunTrigger::Scheduled);
        fx.store.upsert_run(&run).unwrap();
        fx.store
            .transition_run(&run.id, &[RunState::Due], RunState::Running, Some(now - Duration::hours(1)))
            .unwrap();
        fx.store
            .acquire_lock(&Lock::new("crash", &run.id, now - Duration::hours(1), None))
            .unwrap();

        assert_eq!(fx.runner.reconcile_abandoned(now).unwrap(), 1);
        let row = fx.store.require_run(&run.id).unwrap();
        assert_eq!(row.state, RunState::Failed);
        assert_eq!(row.error_code.as_deref(), Some(ABANDONED));
        assert!(fx.store.get_lock("crash", now).unwrap().is_none());
        assert_eq!(fx.runner.reconcile_abandoned(now).unwrap(), 0);
    }

    #[tokio::test]
    async fn executing_a_finished_run_is_refused() {
        let fx = fixture(Arc::new(Scripted::default()));
        fx.store.upsert_job(&job("twice", ConcurrencyPolicy::Allow)).unwrap();
        let run = due_run(&fx.store, "twice");
        fx.runner.execute_run(&run.id).await.unwrap();
        assert!(matches!(
            fx.runner.execute_run(&run.id).await,
            Err(RunnerError::NotDue { state: RunState::Succeeded, .. })
        ));
    }
}
