use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use recur_core::time::{fmt_opt_ts, fmt_ts, parse_ts};
use recur_core::{
    EventLevel, JobDefinition, Lock, ResourceUsage, RunEvent, RunMetadata, RunState,
    ScheduleState,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument};

use crate::db;
use crate::error::{Result, StoreError};

const RUN_COLUMNS: &str = "id, job_id, scheduled_at, started_at, completed_at, state, attempt,
     trigger_kind, error_code, error_message, usage, inputs_override, output_hash";

const SCHEDULE_COLUMNS: &str =
    "job_id, next_due, next_occurrence, last_scheduled, last_success, last_attempt, timezone";

/// Thread-safe handle over one SQLite connection.
///
/// Every method is a short transaction. Admission safety across processes
/// comes from SQLite itself (`UNIQUE(resource)` on `locks`, compare-and-set
/// updates on `schedules` and `runs`), never from this mutex.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Wrap an open connection, applying pragmas and the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        db::configure(&conn)?;
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening store");
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave SQLite half-written:
        // every multi-statement write runs inside a transaction.
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- jobs ----------------------------------------------------------------

    /// Insert or overwrite a job. Never re-inserts an existing row, so the
    /// job's runs and schedule survive the update.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn upsert_job(&self, job: &JobDefinition) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let definition = serde_json::to_string(job)?;
        self.conn().execute(
            "INSERT INTO jobs
             (id, version, name, enabled, concurrency, priority, definition, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET
                version     = excluded.version,
                name        = excluded.name,
                enabled     = excluded.enabled,
                concurrency = excluded.concurrency,
                priority    = excluded.priority,
                definition  = excluded.definition,
                updated_at  = excluded.updated_at",
            params![
                job.id,
                job.version,
                job.name,
                job.enabled,
                job.concurrency.as_str(),
                job.priority,
                definition,
                now
            ],
        )?;
        debug!("job upserted");
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobDefinition>> {
        self.conn()
            .query_row(
                "SELECT definition, enabled FROM jobs WHERE id = ?1",
                [id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?
            .map(|(json, enabled)| decode_job(&json, enabled))
            .transpose()
    }

    /// Like [`get_job`](Self::get_job) but a missing job is an error.
    pub fn require_job(&self, id: &str) -> Result<JobDefinition> {
        self.get_job(id)?
            .ok_or_else(|| StoreError::JobNotFound { id: id.to_string() })
    }

    /// All jobs ordered by creation time.
    pub fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT definition, enabled FROM jobs ORDER BY created_at, id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|(json, enabled)| decode_job(json, *enabled))
            .collect()
    }

    #[instrument(skip(self))]
    pub fn set_job_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE jobs SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, fmt_ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(StoreError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Delete a job together with its runs, events, schedule and locks.
    #[instrument(skip(self))]
    pub fn delete_job(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM locks
             WHERE resource = ?1 OR owner IN (SELECT id FROM runs WHERE job_id = ?1)",
            [id],
        )?;
        tx.execute(
            "DELETE FROM run_events WHERE run_id IN (SELECT id FROM runs WHERE job_id = ?1)",
            [id],
        )?;
        tx.execute("DELETE FROM runs WHERE job_id = ?1", [id])?;
        tx.execute("DELETE FROM schedules WHERE job_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            // Dropping `tx` rolls back.
            return Err(StoreError::JobNotFound { id: id.to_string() });
        }
        tx.commit()?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    // --- schedules -----------------------------------------------------------

    pub fn upsert_schedule(&self, schedule: &ScheduleState) -> Result<()> {
        let conn = self.conn();
        if !job_exists(&conn, &schedule.job_id)? {
            return Err(StoreError::JobNotFound {
                id: schedule.job_id.clone(),
            });
        }
        conn.execute(
            "INSERT INTO schedules
             (job_id, next_due, next_occurrence, last_scheduled, last_success, last_attempt, timezone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(job_id) DO UPDATE SET
                next_due        = excluded.next_due,
                next_occurrence = excluded.next_occurrence,
                last_scheduled  = excluded.last_scheduled,
                last_success    = excluded.last_success,
                last_attempt    = excluded.last_attempt,
                timezone        = excluded.timezone",
            params![
                schedule.job_id,
                fmt_opt_ts(schedule.next_due),
                fmt_opt_ts(schedule.next_occurrence),
                fmt_opt_ts(schedule.last_scheduled),
                fmt_opt_ts(schedule.last_success),
                fmt_opt_ts(schedule.last_attempt),
                schedule.timezone
            ],
        )?;
        Ok(())
    }

    pub fn get_schedule(&self, job_id: &str) -> Result<Option<ScheduleState>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE job_id = ?1"),
                [job_id],
                row_to_schedule,
            )
            .optional()?)
    }

    /// Every schedule whose `next_due` has arrived, earliest first.
    pub fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE next_due IS NOT NULL AND next_due <= ?1
             ORDER BY next_due"
        ))?;
        let rows = stmt
            .query_map([fmt_ts(now)], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Compare-and-set on `next_due`: only the caller that still sees
    /// `expected_next_due` advances the row. Used so exactly one process
    /// materializes each due slot.
    pub fn claim_schedule(
        &self,
        expected_next_due: DateTime<Utc>,
        next: &ScheduleState,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE schedules
             SET next_due = ?1, next_occurrence = ?2, last_scheduled = ?3, timezone = ?4
             WHERE job_id = ?5 AND next_due = ?6",
            params![
                fmt_opt_ts(next.next_due),
                fmt_opt_ts(next.next_occurrence),
                fmt_opt_ts(next.last_scheduled),
                next.timezone,
                next.job_id,
                fmt_ts(expected_next_due)
            ],
        )?;
        Ok(n == 1)
    }

    /// Stamp `last_attempt` (and `last_success` when `succeeded`).
    pub fn record_attempt(&self, job_id: &str, at: DateTime<Utc>, succeeded: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE schedules
             SET last_attempt = ?2,
                 last_success = CASE WHEN ?3 THEN ?2 ELSE last_success END
             WHERE job_id = ?1",
            params![job_id, fmt_ts(at), succeeded],
        )?;
        Ok(())
    }

    // --- runs ----------------------------------------------------------------

    /// Insert or overwrite a run. Rows that already reached a finished state
    /// are never touched; returns whether a row was written.
    #[instrument(skip(self, run), fields(run_id = %run.id, state = %run.state))]
    pub fn upsert_run(&self, run: &RunMetadata) -> Result<bool> {
        let conn = self.conn();
        if !job_exists(&conn, &run.job_id)? {
            return Err(StoreError::JobNotFound {
                id: run.job_id.clone(),
            });
        }
        let usage = serde_json::to_string(&run.resource_usage)?;
        let inputs = run
            .inputs_override
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let n = conn.execute(
            &format!(
                "INSERT INTO runs ({RUN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    job_id          = excluded.job_id,
                    scheduled_at    = excluded.scheduled_at,
                    started_at      = excluded.started_at,
                    completed_at    = excluded.completed_at,
                    state           = excluded.state,
                    attempt         = excluded.attempt,
                    trigger_kind    = excluded.trigger_kind,
                    error_code      = excluded.error_code,
                    error_message   = excluded.error_message,
                    usage           = excluded.usage,
                    inputs_override = excluded.inputs_override,
                    output_hash     = excluded.output_hash
                 WHERE runs.state IN ('DUE', 'STARTING', 'RUNNING')"
            ),
            params![
                run.id,
                run.job_id,
                fmt_ts(run.scheduled_at),
                fmt_opt_ts(run.started_at),
                fmt_opt_ts(run.completed_at),
                run.state.as_str(),
                run.attempt,
                run.trigger.as_str(),
                run.error_code,
                run.error_message,
                usage,
                inputs,
                run.output_hash
            ],
        )?;
        Ok(n == 1)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<RunMetadata>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [id],
                row_to_run,
            )
            .optional()?)
    }

    pub fn require_run(&self, id: &str) -> Result<RunMetadata> {
        self.get_run(id)?
            .ok_or_else(|| StoreError::RunNotFound { id: id.to_string() })
    }

    /// Most recent runs of a job, newest first.
    pub fn list_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RunMetadata>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE job_id = ?1
                 ORDER BY scheduled_at DESC, id DESC LIMIT ?2"
            ),
            params![job_id, limit as i64],
        )
    }

    /// DUE runs whose `scheduled_at` has arrived, oldest first.
    pub fn due_runs(&self, now: DateTime<Utc>) -> Result<Vec<RunMetadata>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE state = 'DUE' AND scheduled_at <= ?1
                 ORDER BY scheduled_at, id"
            ),
            params![fmt_ts(now)],
        )
    }

    /// STARTING or RUNNING runs of one job.
    pub fn active_runs(&self, job_id: &str) -> Result<Vec<RunMetadata>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE job_id = ?1 AND state IN ('STARTING', 'RUNNING')
                 ORDER BY scheduled_at, id"
            ),
            params![job_id],
        )
    }

    /// Active runs that started (or, if never stamped, were scheduled) at or
    /// before `cutoff`. Candidates for abandonment after a crash.
    pub fn stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunMetadata>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE state IN ('STARTING', 'RUNNING')
                   AND COALESCE(started_at, scheduled_at) <= ?1
                 ORDER BY scheduled_at, id"
            ),
            params![fmt_ts(cutoff)],
        )
    }

    pub fn count_runs(&self, job_id: &str, state: RunState) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM runs WHERE job_id = ?1 AND state = ?2",
            params![job_id, state.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Conditional state transition. Succeeds only when the run is currently
    /// in one of `from` and not finished; `started_at` is stamped when given.
    pub fn transition_run(
        &self,
        run_id: &str,
        from: &[RunState],
        to: RunState,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let from_list = state_list(from);
        let n = self.conn().execute(
            &format!(
                "UPDATE runs SET state = ?1, started_at = COALESCE(?2, started_at)
                 WHERE id = ?3 AND state IN ({from_list})
                   AND state NOT IN ('SUCCEEDED', 'FAILED', 'FAILED_RETRYABLE', 'CANCELLED')"
            ),
            params![to.as_str(), fmt_opt_ts(started_at), run_id],
        )?;
        Ok(n == 1)
    }

    /// Final write of a run's outcome. Only applies while the run is still
    /// DUE, STARTING or RUNNING, so a concurrently cancelled run keeps its
    /// CANCELLED state.
    #[instrument(skip(self, run), fields(run_id = %run.id, state = %run.state))]
    pub fn finish_run(&self, run: &RunMetadata) -> Result<bool> {
        let usage = serde_json::to_string(&run.resource_usage)?;
        let n = self.conn().execute(
            "UPDATE runs SET
                state         = ?1,
                started_at    = COALESCE(started_at, ?2),
                completed_at  = ?3,
                error_code    = ?4,
                error_message = ?5,
                usage         = ?6,
                output_hash   = ?7
             WHERE id = ?8 AND state IN ('DUE', 'STARTING', 'RUNNING')",
            params![
                run.state.as_str(),
                fmt_opt_ts(run.started_at),
                fmt_opt_ts(run.completed_at),
                run.error_code,
                run.error_message,
                usage,
                run.output_hash,
                run.id
            ],
        )?;
        Ok(n == 1)
    }

    /// Output hash of the job's latest successful run other than `exclude_run`.
    pub fn last_output_hash(&self, job_id: &str, exclude_run: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT output_hash FROM runs
                 WHERE job_id = ?1 AND id <> ?2 AND state = 'SUCCEEDED'
                   AND output_hash IS NOT NULL
                 ORDER BY completed_at DESC LIMIT 1",
                params![job_id, exclude_run],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn query_runs(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RunMetadata>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // --- events --------------------------------------------------------------

    /// Append an event. Independent of the run's state, so events written
    /// while a run is being finalized or cancelled are never lost. The
    /// timestamp is clamped so it never precedes the run's previous event.
    pub fn append_event(
        &self,
        run_id: &str,
        level: EventLevel,
        event: &str,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<RunEvent> {
        let data_json = data.as_ref().map(serde_json::to_string).transpose()?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM runs WHERE id = ?1)",
            [run_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::RunNotFound {
                id: run_id.to_string(),
            });
        }

        let last: Option<String> = tx.query_row(
            "SELECT MAX(timestamp) FROM run_events WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;
        let now = Utc::now();
        let timestamp = match last.as_deref().map(parse_ts).transpose() {
            Ok(Some(last)) if last > now => last,
            Ok(_) => now,
            Err(e) => {
                return Err(StoreError::Corrupt {
                    table: "run_events",
                    reason: e.to_string(),
                })
            }
        };

        tx.execute(
            "INSERT INTO run_events (run_id, timestamp, level, event, message, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                fmt_ts(timestamp),
                level.as_str(),
                event,
                message,
                data_json
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(RunEvent {
            id,
            run_id: run_id.to_string(),
            timestamp,
            level,
            event: event.to_string(),
            message: message.to_string(),
            data,
        })
    }

    /// Events of a run in replay order.
    pub fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.events_after(run_id, 0)
    }

    /// Events with an id greater than `after_id`, for incremental tailing.
    pub fn events_after(&self, run_id: &str, after_id: i64) -> Result<Vec<RunEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, run_id, timestamp, level, event, message, data FROM run_events
             WHERE run_id = ?1 AND id > ?2
             ORDER BY timestamp, id",
        )?;
        let rows = stmt
            .query_map(params![run_id, after_id], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // --- locks ---------------------------------------------------------------

    /// Try to take `lock`. True iff no live lock held its resource.
    ///
    /// An expired holder is swept first; the acquisition itself is a single
    /// insert guarded by `UNIQUE(resource)`, inside an IMMEDIATE transaction
    /// so concurrent writers from other processes serialise on SQLite.
    #[instrument(skip(self, lock), fields(resource = %lock.resource, owner = %lock.owner))]
    pub fn acquire_lock(&self, lock: &Lock) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM locks
             WHERE resource = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![lock.resource, fmt_ts(lock.acquired_at)],
        )?;
        let n = tx.execute(
            "INSERT OR IGNORE INTO locks (id, resource, owner, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                lock.id,
                lock.resource,
                lock.owner,
                fmt_ts(lock.acquired_at),
                fmt_opt_ts(lock.expires_at)
            ],
        )?;
        tx.commit()?;
        debug!(acquired = n == 1, "lock acquisition");
        Ok(n == 1)
    }

    /// Release `resource` if `owner` holds it. Returns false (and changes
    /// nothing) otherwise.
    pub fn release_lock(&self, resource: &str, owner: &str) -> Result<bool> {
        let n = self.conn().execute(
            "DELETE FROM locks WHERE resource = ?1 AND owner = ?2",
            params![resource, owner],
        )?;
        Ok(n == 1)
    }

    /// The live lock on `resource`, if any.
    pub fn get_lock(&self, resource: &str, now: DateTime<Utc>) -> Result<Option<Lock>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, resource, owner, acquired_at, expires_at FROM locks
                 WHERE resource = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![resource, fmt_ts(now)],
                row_to_lock,
            )
            .optional()?)
    }

    pub fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM locks WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [fmt_ts(now)],
        )?;
        if n > 0 {
            debug!(count = n, "expired locks purged");
        }
        Ok(n)
    }

    /// Drop every lock held by `owner` (a run id).
    pub fn release_locks_owned_by(&self, owner: &str) -> Result<usize> {
        Ok(self
            .conn()
            .execute("DELETE FROM locks WHERE owner = ?1", [owner])?)
    }
}

// --- row mapping --------------------------------------------------------------

fn job_exists(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )?)
}

fn decode_job(json: &str, enabled: bool) -> Result<JobDefinition> {
    let mut job: JobDefinition = serde_json::from_str(json)?;
    // The column is authoritative; pause/resume only touch it.
    job.enabled = enabled;
    Ok(job)
}

fn state_list(states: &[RunState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn conversion_error(idx: usize, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, reason.into())
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| conversion_error(idx, e.to_string()))
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(&s).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleState> {
    Ok(ScheduleState {
        job_id: row.get(0)?,
        next_due: opt_ts_col(row, 1)?,
        next_occurrence: opt_ts_col(row, 2)?,
        last_scheduled: opt_ts_col(row, 3)?,
        last_success: opt_ts_col(row, 4)?,
        last_attempt: opt_ts_col(row, 5)?,
        timezone: row.get(6)?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunMetadata> {
    let state: String = row.get(5)?;
    let trigger: String = row.get(7)?;
    Ok(RunMetadata {
        id: row.get(0)?,
        job_id: row.get(1)?,
        scheduled_at: ts_col(row, 2)?,
        started_at: opt_ts_col(row, 3)?,
        completed_at: opt_ts_col(row, 4)?,
        state: state.parse().map_err(|e| conversion_error(5, e))?,
        attempt: row.get(6)?,
        trigger: trigger.parse().map_err(|e| conversion_error(7, e))?,
        error_code: row.get(8)?,
        error_message: row.get(9)?,
        resource_usage: json_col::<ResourceUsage>(row, 10)?.unwrap_or_default(),
        inputs_override: json_col(row, 11)?,
        output_hash: row.get(12)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunEvent> {
    let level: String = row.get(3)?;
    Ok(RunEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        timestamp: ts_col(row, 2)?,
        level: level.parse().map_err(|e| conversion_error(3, e))?,
        event: row.get(4)?,
        message: row.get(5)?,
        data: json_col(row, 6)?,
    })
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lock> {
    Ok(Lock {
        id: row.get(0)?,
        resource: row.get(1)?,
        owner: row.get(2)?,
        acquired_at: ts_col(row, 3)?,
        expires_at: opt_ts_col(row, 4)?,
    })
}
