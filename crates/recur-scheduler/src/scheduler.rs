use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use recur_core::config::SchedulerConfig;
use recur_core::time::fmt_ts;
use recur_core::{
    ConcurrencyPolicy, EventLevel, JobDefinition, Lock, RunMetadata, RunState, RunTrigger,
    ScheduleState,
};
use recur_store::Store;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::admission::Admission;
use crate::error::Result;
use crate::next_due::{apply_jitter, JobClock, NextDue};

/// Error code recorded on runs dropped because the job's wait queue is full.
pub const QUEUE_FULL: &str = "QUEUE_FULL";
/// Error code recorded on runs superseded under `cancel-previous`.
pub const SUPERSEDED: &str = "CANCELLED";

/// Computes schedules, materializes due slots into runs and performs
/// admission control. Stateless apart from the shared store handle.
pub struct Scheduler {
    store: Arc<Store>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Lock TTL for a job: its run budget plus a grace period, so a crashed
    /// holder never blocks the job forever.
    pub fn lock_ttl(&self, job: &JobDefinition) -> Duration {
        let secs = job.resources.max_run_seconds + self.config.lock_grace_secs;
        Duration::seconds(secs as i64)
    }

    // --- schedule computation ------------------------------------------------

    /// Compute and persist the job's next due slot as of now.
    pub fn schedule_job(&self, job: &JobDefinition) -> Result<ScheduleState> {
        self.schedule_job_at(job, Utc::now())
    }

    /// Compute and persist the job's next due slot as of `now`. Disabled jobs
    /// and jobs past their window end up with `next_due = None`.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn schedule_job_at(&self, job: &JobDefinition, now: DateTime<Utc>) -> Result<ScheduleState> {
        let mut state = self
            .store
            .get_schedule(&job.id)?
            .unwrap_or_else(|| ScheduleState::empty(&job.id, &job.timezone));
        state.timezone = job.timezone.clone();

        let next = if job.enabled {
            self.compute(job, state.last_scheduled, now)?
        } else {
            None
        };
        state.next_occurrence = next.map(|n| n.occurrence);
        state.next_due = next.map(|n| n.due);
        self.store.upsert_schedule(&state)?;

        match state.next_due {
            Some(due) => info!(next_due = %fmt_ts(due), "job scheduled"),
            None => info!(enabled = job.enabled, "job has no upcoming slot"),
        }
        Ok(state)
    }

    /// Advance a schedule after its slot `fired` came due. Returns false when
    /// another process already advanced it, in which case the caller must
    /// not create a run for the slot.
    pub fn update_schedule(
        &self,
        job: &JobDefinition,
        fired: &ScheduleState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(expected) = fired.next_due else {
            return Ok(false);
        };
        let last_scheduled = fired.next_occurrence.or(fired.next_due);
        let next = if job.enabled {
            self.compute(job, last_scheduled, now)?
        } else {
            None
        };
        let advanced = ScheduleState {
            next_due: next.map(|n| n.due),
            next_occurrence: next.map(|n| n.occurrence),
            last_scheduled,
            timezone: job.timezone.clone(),
            ..fired.clone()
        };
        Ok(self.store.claim_schedule(expected, &advanced)?)
    }

    /// Recompute every job's schedule, e.g. after a restart or a timezone
    /// database change. Returns how many jobs have an upcoming slot.
    pub fn update_all_schedules(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut scheduled = 0;
        for job in self.store.list_jobs()? {
            match self.schedule_job_at(&job, now) {
                Ok(state) if state.next_due.is_some() => scheduled += 1,
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, code = e.code(), "failed to reschedule: {e}"),
            }
        }
        Ok(scheduled)
    }

    pub fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>> {
        Ok(self.store.get_due_schedules(now)?)
    }

    fn compute(
        &self,
        job: &JobDefinition,
        last_scheduled: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<NextDue>> {
        let clock = JobClock::for_job(job)?;
        let Some(occurrence) = clock.next_occurrence(job, last_scheduled, now) else {
            return Ok(None);
        };
        let jitter = if job.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=job.jitter_ms)
        };
        Ok(Some(apply_jitter(job, occurrence, jitter)))
    }

    // --- run materialization -------------------------------------------------

    /// Turn every due schedule into a DUE run, then return the runs that are
    /// ready to start, highest priority first and oldest first within a
    /// priority. For `queue` jobs only the head of the queue is returned,
    /// and only while the job's lock is free.
    #[instrument(skip(self))]
    pub fn get_pending_runs(&self, now: DateTime<Utc>) -> Result<Vec<RunMetadata>> {
        self.materialize_due_schedules(now)?;

        let mut jobs: HashMap<String, Option<JobDefinition>> = HashMap::new();
        let mut queue_heads: HashSet<String> = HashSet::new();
        let mut pending = Vec::new();

        for run in self.store.due_runs(now)? {
            if !jobs.contains_key(&run.job_id) {
                jobs.insert(run.job_id.clone(), self.store.get_job(&run.job_id)?);
            }
            let Some(Some(job)) = jobs.get(&run.job_id) else {
                continue;
            };
            if job.concurrency == ConcurrencyPolicy::Queue {
                if !queue_heads.insert(job.id.clone()) {
                    continue;
                }
                if self.store.get_lock(&job.id, now)?.is_some() {
                    debug!(job_id = %job.id, run_id = %run.id, "queued behind running run");
                    continue;
                }
            }
            pending.push((job.priority, run));
        }

        pending.sort_by(|(pa, a), (pb, b)| pb.cmp(pa).then(a.scheduled_at.cmp(&b.scheduled_at)));
        Ok(pending.into_iter().map(|(_, run)| run).collect())
    }

    /// Create one run per due schedule slot. Returns how many runs were
    /// created (including runs recorded FAILED because the queue was full).
    pub fn materialize_due_schedules(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut created = 0;
        for sched in self.store.get_due_schedules(now)? {
            let Some(job) = self.store.get_job(&sched.job_id)? else {
                continue;
            };
            let Some(due) = sched.next_due else {
                continue;
            };
            if !job.enabled {
                self.schedule_job_at(&job, now)?;
                continue;
            }
            let occurrence = sched.next_occurrence.unwrap_or(due);
            let stale = !job.catchup && JobClock::for_job(&job)?.missed_multiple(occurrence, now);

            if !self.update_schedule(&job, &sched, now)? {
                debug!(job_id = %job.id, "slot already claimed by another process");
                continue;
            }
            if stale {
                warn!(
                    job_id = %job.id,
                    occurrence = %fmt_ts(occurrence),
                    "missed windows skipped (catchup disabled)"
                );
                continue;
            }

            self.create_scheduled_run(&job, due, occurrence, now)?;
            created += 1;
        }
        Ok(created)
    }

    fn create_scheduled_run(
        &self,
        job: &JobDefinition,
        due: DateTime<Utc>,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RunMetadata> {
        let mut run = RunMetadata::new_due(&job.id, due, 0, RunTrigger::Scheduled);

        if job.concurrency == ConcurrencyPolicy::Queue {
            let waiting = self.store.count_runs(&job.id, RunState::Due)?;
            if waiting >= self.config.max_queue_depth {
                run.state = RunState::Failed;
                run.completed_at = Some(now);
                run.error_code = Some(QUEUE_FULL.to_string());
                run.error_message = Some("queue full".to_string());
                self.store.upsert_run(&run)?;
                self.store.append_event(
                    &run.id,
                    EventLevel::Warn,
                    "run.rejected",
                    "queue full",
                    Some(json!({ "waiting": waiting, "maxQueueDepth": self.config.max_queue_depth })),
                )?;
                self.store.record_attempt(&job.id, now, false)?;
                warn!(job_id = %job.id, run_id = %run.id, waiting, "queue full, run dropped");
                return Ok(run);
            }
        }

        self.store.upsert_run(&run)?;
        self.store.append_event(
            &run.id,
            EventLevel::Info,
            "run.scheduled",
            "run created for due schedule slot",
            Some(json!({ "occurrence": fmt_ts(occurrence), "scheduledAt": fmt_ts(due) })),
        )?;
        info!(job_id = %job.id, run_id = %run.id, "run scheduled");
        Ok(run)
    }

    // --- admission -----------------------------------------------------------

    /// Apply the job's concurrency policy to `run_id`. On admission under a
    /// locking policy the job lock is held by `run_id` and must be released
    /// by the caller when the run finishes.
    #[instrument(skip(self, job), fields(job_id = %job.id, policy = %job.concurrency))]
    pub fn can_run_job(&self, job: &JobDefinition, run_id: &str) -> Result<Admission> {
        let now = Utc::now();
        match job.concurrency {
            ConcurrencyPolicy::Allow => Ok(Admission::admitted()),
            ConcurrencyPolicy::Skip => {
                if self.try_lock(job, run_id, now)? {
                    Ok(Admission::admitted())
                } else {
                    Ok(Admission::Rejected {
                        reason: "job already running".to_string(),
                    })
                }
            }
            ConcurrencyPolicy::Queue => {
                if self.try_lock(job, run_id, now)? {
                    Ok(Admission::admitted())
                } else {
                    Ok(Admission::Deferred {
                        reason: "waiting for the running run to finish".to_string(),
                    })
                }
            }
            ConcurrencyPolicy::CancelPrevious => self.cancel_previous(job, run_id, now),
        }
    }

    fn try_lock(&self, job: &JobDefinition, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let lock = Lock::new(&job.id, run_id, now, Some(self.lock_ttl(job)));
        Ok(self.store.acquire_lock(&lock)?)
    }

    fn cancel_previous(&self, job: &JobDefinition, run_id: &str, now: DateTime<Utc>) -> Result<Admission> {
        let mut cancelled = Vec::new();
        // A second sweep covers a holder that slipped in between release and acquire.
        for _ in 0..2 {
            let mut victims: Vec<String> = self
                .store
                .active_runs(&job.id)?
                .into_iter()
                .filter(|r| r.id != run_id && r.state != RunState::Due)
                .map(|r| r.id)
                .collect();
            if let Some(holder) = self.store.get_lock(&job.id, now)? {
                if holder.owner != run_id && !victims.contains(&holder.owner) {
                    victims.push(holder.owner);
                }
            }

            for victim in victims {
                if self.cancel_run(&victim, run_id, now)? && !cancelled.contains(&victim) {
                    cancelled.push(victim.clone());
                }
                self.store.release_lock(&job.id, &victim)?;
            }

            if self.try_lock(job, run_id, now)? {
                if !cancelled.is_empty() {
                    info!(run_id, cancelled = cancelled.len(), "previous runs cancelled");
                }
                return Ok(Admission::Admitted { cancelled });
            }
            debug!(run_id, "lost lock race while cancelling, retrying");
        }
        Ok(Admission::Rejected {
            reason: "lost lock race while cancelling the previous run".to_string(),
        })
    }

    /// Mark `victim` CANCELLED if it is still active. Returns false when it
    /// already finished.
    fn cancel_run(&self, victim: &str, superseded_by: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut run) = self.store.get_run(victim)? else {
            return Ok(false);
        };
        if !run.state.is_active() {
            return Ok(false);
        }
        run.state = RunState::Cancelled;
        run.completed_at = Some(now);
        run.error_code = Some(SUPERSEDED.to_string());
        run.error_message = Some(format!("superseded by run {superseded_by}"));
        if !self.store.finish_run(&run)? {
            return Ok(false);
        }
        self.store.append_event(
            victim,
            EventLevel::Warn,
            "run.cancelled",
            "cancelled by a newer run (cancel-previous)",
            Some(json!({ "supersededBy": superseded_by })),
        )?;
        Ok(true)
    }

    // --- run bookkeeping -----------------------------------------------------

    /// STARTING (or DUE) → RUNNING, stamping `started_at`.
    pub fn mark_run_started(&self, run_id: &str, at: DateTime<Utc>) -> Result<bool> {
        Ok(self.store.transition_run(
            run_id,
            &[RunState::Due, RunState::Starting],
            RunState::Running,
            Some(at),
        )?)
    }

    /// Stamp the schedule's `last_attempt` / `last_success`.
    pub fn record_run_outcome(&self, job_id: &str, succeeded: bool, at: DateTime<Utc>) -> Result<()> {
        Ok(self.store.record_attempt(job_id, at, succeeded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scheduler() -> Scheduler {
        let store = Arc::new(Store::open_in_memory().unwrap());
        Scheduler::new(store, SchedulerConfig::default())
    }

    fn job(id: &str, concurrency: ConcurrencyPolicy) -> JobDefinition {
        JobDefinition {
            id: id.into(),
            name: id.into(),
            schedule: "0 * * * *".into(),
            graph_id: "g".into(),
            concurrency,
            ..Default::default()
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, h, m, 0).unwrap()
    }

    fn add(s: &Scheduler, job: &JobDefinition, now: DateTime<Utc>) -> ScheduleState {
        s.store().upsert_job(job).unwrap();
        s.schedule_job_at(job, now).unwrap()
    }

    #[test]
    fn schedule_job_persists_the_next_slot() {
        let s = scheduler();
        let state = add(&s, &job("a", ConcurrencyPolicy::Allow), at(6, 30));
        assert_eq!(state.next_due, Some(at(7, 0)));
        assert_eq!(s.store().get_schedule("a").unwrap().unwrap(), state);
    }

    #[test]
    fn jittered_due_stays_within_bounds() {
        let s = scheduler();
        let j = JobDefinition {
            jitter_ms: 60_000,
            ..job("j", ConcurrencyPolicy::Allow)
        };
        for _ in 0..20 {
            let state = add(&s, &j, at(6, 30));
            let due = state.next_due.unwrap();
            assert_eq!(state.next_occurrence, Some(at(7, 0)));
            assert!(due >= at(7, 0) && due <= at(7, 1));
        }
    }

    #[test]
    fn restart_without_catchup_lands_in_the_future() {
        let s = scheduler();
        let j = job("offline", ConcurrencyPolicy::Allow);
        add(&s, &j, at(1, 30));
        // Offline from 01:30 until 06:30; several hourly windows missed.
        s.update_all_schedules(at(6, 30)).unwrap();
        let state = s.store().get_schedule("offline").unwrap().unwrap();
        assert!(state.next_due.unwrap() > at(6, 30));
    }

    #[test]
    fn disabled_jobs_have_no_slot() {
        let s = scheduler();
        let j = JobDefinition {
            enabled: false,
            ..job("off", ConcurrencyPolicy::Allow)
        };
        assert!(add(&s, &j, at(6, 30)).next_due.is_none());
        assert_eq!(s.update_all_schedules(at(6, 30)).unwrap(), 0);
    }

    #[test]
    fn a_due_slot_becomes_exactly_one_run() {
        let s = scheduler();
        let j = job("once", ConcurrencyPolicy::Allow);
        add(&s, &j, at(6, 30));

        let pending = s.get_pending_runs(at(7, 0)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_at, at(7, 0));
        assert_eq!(pending[0].trigger, RunTrigger::Scheduled);

        // The slot advanced; polling again yields the same run, not a new one.
        let again = s.get_pending_runs(at(7, 0)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, pending[0].id);

        let state = s.store().get_schedule("once").unwrap().unwrap();
        assert_eq!(state.last_scheduled, Some(at(7, 0)));
        assert_eq!(state.next_due, Some(at(8, 0)));
    }

    #[test]
    fn stale_slot_without_catchup_is_skipped() {
        let s = scheduler();
        let j = job("stale", ConcurrencyPolicy::Allow);
        add(&s, &j, at(6, 30));
        // Next poll happens hours after the 07:00 slot.
        assert!(s.get_pending_runs(at(10, 30)).unwrap().is_empty());
        let state = s.store().get_schedule("stale").unwrap().unwrap();
        assert_eq!(state.next_due, Some(at(11, 0)));
    }

    #[test]
    fn catchup_replays_every_missed_slot() {
        let s = scheduler();
        let j = JobDefinition {
            catchup: true,
            ..job("replay", ConcurrencyPolicy::Allow)
        };
        add(&s, &j, at(6, 30));
        let mut slots = Vec::new();
        for _ in 0..4 {
            s.materialize_due_schedules(at(10, 30)).unwrap();
        }
        for run in s.store().list_runs("replay", 10).unwrap() {
            slots.push(run.scheduled_at);
        }
        slots.sort();
        assert_eq!(slots, vec![at(7, 0), at(8, 0), at(9, 0), at(10, 0)]);
    }

    #[test]
    fn pending_runs_are_ordered_by_priority_then_age() {
        let s = scheduler();
        let low = job("low", ConcurrencyPolicy::Allow);
        let high = JobDefinition {
            priority: 10,
            ..job("high", ConcurrencyPolicy::Allow)
        };
        s.store().upsert_job(&low).unwrap();
        s.store().upsert_job(&high).unwrap();
        let old_low = RunMetadata::new_due("low", at(5, 0), 0, RunTrigger::Manual);
        let new_low = RunMetadata::new_due("low", at(6, 0), 0, RunTrigger::Manual);
        let new_high = RunMetadata::new_due("high", at(6, 0), 0, RunTrigger::Manual);
        for r in [&new_low, &new_high, &old_low] {
            s.store().upsert_run(r).unwrap();
        }

        let ids: Vec<_> = s
            .get_pending_runs(at(6, 30))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![new_high.id, old_low.id, new_low.id]);
    }

    #[test]
    fn skip_policy_rejects_while_locked() {
        let s = scheduler();
        let j = job("skip", ConcurrencyPolicy::Skip);
        s.store().upsert_job(&j).unwrap();

        assert!(s.can_run_job(&j, "run-a").unwrap().can_run());
        let second = s.can_run_job(&j, "run-b").unwrap();
        assert!(!second.can_run());
        assert_eq!(second.reason(), Some("job already running"));

        s.store().release_lock("skip", "run-a").unwrap();
        assert!(s.can_run_job(&j, "run-b").unwrap().can_run());
    }

    #[test]
    fn allow_policy_takes_no_lock() {
        let s = scheduler();
        let j = job("free", ConcurrencyPolicy::Allow);
        s.store().upsert_job(&j).unwrap();
        assert!(s.can_run_job(&j, "a").unwrap().can_run());
        assert!(s.can_run_job(&j, "b").unwrap().can_run());
        assert!(s.store().get_lock("free", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn queue_policy_defers_and_serves_one_head() {
        let s = scheduler();
        let j = job("q", ConcurrencyPolicy::Queue);
        s.store().upsert_job(&j).unwrap();
        let first = RunMetadata::new_due("q", at(6, 0), 0, RunTrigger::Manual);
        let second = RunMetadata::new_due("q", at(6, 5), 0, RunTrigger::Manual);
        s.store().upsert_run(&first).unwrap();
        s.store().upsert_run(&second).unwrap();

        let pending = s.get_pending_runs(at(6, 30)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);

        assert!(s.can_run_job(&j, &first.id).unwrap().can_run());
        assert!(matches!(
            s.can_run_job(&j, &second.id).unwrap(),
            Admission::Deferred { .. }
        ));
        // While the lock is held the queue head is withheld.
        let now = Utc::now();
        assert!(s.get_pending_runs(now).unwrap().iter().all(|r| r.job_id != "q"));
    }

    #[test]
    fn full_queue_records_a_failed_run() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let s = Scheduler::new(
            store,
            SchedulerConfig {
                max_queue_depth: 1,
                ..Default::default()
            },
        );
        let j = job("full", ConcurrencyPolicy::Queue);
        add(&s, &j, at(6, 30));
        s.store()
            .upsert_run(&RunMetadata::new_due("full", at(6, 0), 0, RunTrigger::Manual))
            .unwrap();

        s.materialize_due_schedules(at(7, 0)).unwrap();
        let runs = s.store().list_runs("full", 10).unwrap();
        let dropped = runs.iter().find(|r| r.state == RunState::Failed).unwrap();
        assert_eq!(dropped.error_code.as_deref(), Some(QUEUE_FULL));
        assert_eq!(dropped.error_message.as_deref(), Some("queue full"));
        assert_eq!(s.store().count_runs("full", RunState::Due).unwrap(), 1);
    }

    #[test]
    fn cancel_previous_supersedes_the_running_run() {
        let s = scheduler();
        let j = job("cp", ConcurrencyPolicy::CancelPrevious);
        s.store().upsert_job(&j).unwrap();

        let old = RunMetadata::new_due("cp", at(6, 0), 0, RunTrigger::Manual);
        s.store().upsert_run(&old).unwrap();
        assert!(s.can_run_job(&j, &old.id).unwrap().can_run());
        assert!(s.mark_run_started(&old.id, at(6, 0)).unwrap());

        let new = RunMetadata::new_due("cp", at(7, 0), 0, RunTrigger::Manual);
        s.store().upsert_run(&new).unwrap();
        let admission = s.can_run_job(&j, &new.id).unwrap();
        assert_eq!(
            admission,
            Admission::Admitted {
                cancelled: vec![old.id.clone()]
            }
        );

        let old_row = s.store().require_run(&old.id).unwrap();
        assert_eq!(old_row.state, RunState::Cancelled);
        let lock = s.store().get_lock("cp", Utc::now()).unwrap().unwrap();
        assert_eq!(lock.owner, new.id);
        let events = s.store().list_events(&old.id).unwrap();
        assert!(events.iter().any(|e| e.event == "run.cancelled"));
    }

    #[test]
    fn lock_ttl_covers_the_run_budget_plus_grace() {
        let s = scheduler();
        let mut j = job("ttl", ConcurrencyPolicy::Skip);
        j.resources.max_run_seconds = 120;
        assert_eq!(s.lock_ttl(&j), Duration::seconds(180));
    }

    #[test]
    fn outcome_updates_schedule_timestamps() {
        let s = scheduler();
        add(&s, &job("o", ConcurrencyPolicy::Allow), at(6, 30));
        s.record_run_outcome("o", true, at(7, 1)).unwrap();
        s.record_run_outcome("o", false, at(8, 1)).unwrap();
        let state = s.store().get_schedule("o").unwrap().unwrap();
        assert_eq!(state.last_success, Some(at(7, 1)));
        assert_eq!(state.last_attempt, Some(at(8, 1)));
    }
}
