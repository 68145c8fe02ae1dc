use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use recur_core::config::RecurConfig;
use recur_core::definition::{load_definition, validate};
use recur_core::{JobDefinition, RunEvent, RunMetadata, RunState, ScheduleState};
use recur_runner::{ArtifactStore, ProcessExecutor, Runner, RunnerError};
use recur_scheduler::Scheduler;
use recur_store::Store;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{DriverError, Result};

/// Outcome counts of one [`Driver::process_pending_runs`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    /// Runs that reached a terminal state this pass.
    pub executed: usize,
    pub succeeded: usize,
    /// FAILED, FAILED_RETRYABLE and CANCELLED outcomes.
    pub failed: usize,
    /// `queue` runs put back to DUE, or runs another process claimed first.
    pub deferred: usize,
    /// Runs whose execution raised an error (outcome reconciled later).
    pub errors: usize,
    pub abandoned: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        *self == TickSummary::default()
    }
}

/// What `show` prints for one job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOverview {
    pub job: JobDefinition,
    pub schedule: Option<ScheduleState>,
    pub recent_runs: Vec<RunMetadata>,
}

pub struct Driver {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    runner: Arc<Runner>,
    max_concurrent_runs: usize,
}

impl Driver {
    /// Open the configured database and wire the components together. The
    /// executor is the configured external process, if any.
    pub fn new(config: &RecurConfig) -> Result<Self> {
        let db_path = Path::new(&config.database.path);
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(recur_core::CoreError::from)?;
        }
        let store = Arc::new(Store::open(db_path)?);
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), config.scheduler.clone()));
        let runner = Arc::new(Runner::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            ProcessExecutor::from_config(&config.executor),
            ArtifactStore::new(&config.artifacts.dir),
        ));
        Ok(Self::from_parts(store, scheduler, runner, config.runner.max_concurrent_runs))
    }

    pub fn from_parts(
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        runner: Arc<Runner>,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            store,
            scheduler,
            runner,
            max_concurrent_runs: max_concurrent_runs.max(1),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    // --- loop ----------------------------------------------------------------

    /// Poll every `poll_interval_ms` until `shutdown` broadcasts `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll_ms = self.scheduler.config().poll_interval_ms.max(10);
        info!(poll_ms, max_concurrent_runs = self.max_concurrent_runs, "driver started");
        if let Err(e) = self.ensure_schedules() {
            error!(code = e.code(), "could not initialise schedules: {e}");
        }

        let mut interval = tokio::time::interval(Duration::from_millis(poll_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.process_pending_runs().await {
                        Ok(summary) if summary.is_idle() => {}
                        Ok(summary) => info!(?summary, "tick complete"),
                        Err(e) => error!(code = e.code(), "driver tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("driver shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: purge expired locks, finalize abandoned runs, then execute
    /// every pending run with bounded parallelism. A failing run never
    /// aborts the pass.
    pub async fn process_pending_runs(&self) -> Result<TickSummary> {
        let now = Utc::now();
        let purged = self.store.purge_expired_locks(now)?;
        if purged > 0 {
            debug!(purged, "expired locks purged");
        }
        let mut summary = TickSummary {
            abandoned: self.runner.reconcile_abandoned(now)?,
            ..TickSummary::default()
        };

        let pending = self.scheduler.get_pending_runs(now)?;
        if pending.is_empty() {
            return Ok(summary);
        }
        debug!(count = pending.len(), "pending runs");

        let runner = &self.runner;
        let mut results = stream::iter(pending)
            .map(|run| async move {
                let outcome = runner.execute_run(&run.id).await;
                (run, outcome)
            })
            .buffer_unordered(self.max_concurrent_runs);

        while let Some((run, outcome)) = results.next().await {
            match outcome {
                Ok(done) => match done.state {
                    RunState::Succeeded => {
                        summary.executed += 1;
                        summary.succeeded += 1;
                    }
                    RunState::Due => summary.deferred += 1,
                    _ => {
                        summary.executed += 1;
                        summary.failed += 1;
                    }
                },
                Err(RunnerError::NotDue { state, .. }) => {
                    debug!(run_id = %run.id, %state, "run claimed elsewhere");
                    summary.deferred += 1;
                }
                Err(e) => {
                    summary.errors += 1;
                    error!(job_id = %run.job_id, run_id = %run.id, code = e.code(), "run errored: {e}");
                }
            }
        }
        Ok(summary)
    }

    /// Schedule every job that has no schedule row yet.
    fn ensure_schedules(&self) -> Result<usize> {
        let mut created = 0;
        for job in self.store.list_jobs()? {
            if self.store.get_schedule(&job.id)?.is_none() {
                self.scheduler.schedule_job(&job)?;
                created += 1;
            }
        }
        Ok(created)
    }

    // --- jobs ----------------------------------------------------------------

    /// Validate, persist and schedule a definition. Re-adding an id updates
    /// the job in place.
    pub fn add_job(&self, job: JobDefinition) -> Result<(JobDefinition, ScheduleState)> {
        let job = validate(job).map_err(recur_core::CoreError::from)?;
        self.store.upsert_job(&job)?;
        let schedule = self.scheduler.schedule_job(&job)?;
        info!(job_id = %job.id, version = job.version, "job added");
        Ok((job, schedule))
    }

    pub fn add_job_file(&self, path: &Path) -> Result<(JobDefinition, ScheduleState)> {
        self.add_job(load_definition(path)?)
    }

    pub fn list_jobs(&self) -> Result<Vec<(JobDefinition, Option<ScheduleState>)>> {
        self.store
            .list_jobs()?
            .into_iter()
            .map(|job| -> Result<_> {
                let schedule = self.store.get_schedule(&job.id)?;
                Ok((job, schedule))
            })
            .collect()
    }

    pub fn show_job(&self, job_id: &str, recent: usize) -> Result<JobOverview> {
        let job = self.store.require_job(job_id)?;
        Ok(JobOverview {
            schedule: self.store.get_schedule(job_id)?,
            recent_runs: self.store.list_runs(job_id, recent)?,
            job,
        })
    }

    /// Disable the job and clear its upcoming slot. Runs already DUE or
    /// executing are left alone.
    pub fn pause_job(&self, job_id: &str) -> Result<ScheduleState> {
        let mut job = self.store.require_job(job_id)?;
        self.store.set_job_enabled(job_id, false)?;
        job.enabled = false;
        info!(job_id, "job paused");
        Ok(self.scheduler.schedule_job(&job)?)
    }

    pub fn resume_job(&self, job_id: &str) -> Result<ScheduleState> {
        let mut job = self.store.require_job(job_id)?;
        self.store.set_job_enabled(job_id, true)?;
        job.enabled = true;
        info!(job_id, "job resumed");
        Ok(self.scheduler.schedule_job(&job)?)
    }

    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        if let Some(active) = self.store.active_runs(job_id)?.first() {
            warn!(job_id, run_id = %active.id, "deleting a job with an active run");
        }
        Ok(self.store.delete_job(job_id)?)
    }

    // --- runs ----------------------------------------------------------------

    /// `inputs`, when given, must be a JSON object; it replaces the job's
    /// inputs for this run.
    pub async fn run_now(&self, job_id: &str, inputs: Option<Value>) -> Result<RunMetadata> {
        let inputs = match inputs {
            None => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(DriverError::InvalidInputs(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };
        Ok(self.runner.run_job_now(job_id, inputs).await?)
    }

    pub fn dry_run(&self, job_id: &str) -> Result<RunMetadata> {
        Ok(self.runner.dry_run(job_id)?)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunMetadata> {
        Ok(self.store.require_run(run_id)?)
    }

    pub fn run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.store.require_run(run_id)?;
        Ok(self.store.list_events(run_id)?)
    }

    /// Events with an id greater than `after_id`, for `tail`.
    pub fn events_after(&self, run_id: &str, after_id: i64) -> Result<Vec<RunEvent>> {
        Ok(self.store.events_after(run_id, after_id)?)
    }

    /// Recompute every job's next slot. Returns how many have one.
    pub fn update_schedules(&self) -> Result<usize> {
        Ok(self.scheduler.update_all_schedules(Utc::now())?)
    }
}
