//! Pure next-due computation: cron + timezone, catch-up policy, active
//! window clamp and jitter. No store access and no clock; callers pass `now`.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use recur_core::cron::{parse_timezone, CronSchedule};
use recur_core::JobDefinition;

use crate::error::{Result, SchedulerError};

/// A computed slot: the nominal cron instant and the jittered due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextDue {
    pub occurrence: DateTime<Utc>,
    pub due: DateTime<Utc>,
}

/// Parsed cron expression and timezone of a job.
pub struct JobClock {
    cron: CronSchedule,
    tz: Tz,
}

impl JobClock {
    pub fn for_job(job: &JobDefinition) -> Result<Self> {
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            job_id: job.id.clone(),
            reason,
        };
        Ok(Self {
            cron: CronSchedule::parse(&job.schedule).map_err(invalid)?,
            tz: parse_timezone(&job.timezone).map_err(invalid)?,
        })
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.next_after(after, self.tz)
    }

    /// The un-jittered slot the job should fire next.
    ///
    /// With `catchup` and a known `last_scheduled`, that is the earliest
    /// occurrence after the last fired slot, which may lie in the past.
    /// Otherwise it is the first occurrence strictly after `now`. The result
    /// is moved up to `notBefore` and suppressed past `notAfter`.
    pub fn next_occurrence(
        &self,
        job: &JobDefinition,
        last_scheduled: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let base = match (job.catchup, last_scheduled) {
            (true, Some(last)) => self.next_after(last)?,
            _ => self.next_after(now)?,
        };
        let occurrence = match job.not_before {
            Some(nb) if base < nb => self.cron.next_at_or_after(nb, self.tz)?,
            _ => base,
        };
        match job.not_after {
            Some(na) if occurrence > na => None,
            _ => Some(occurrence),
        }
    }

    /// True when at least one more occurrence after `occurrence` has also
    /// passed, i.e. the process was offline across several windows.
    pub fn missed_multiple(&self, occurrence: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(occurrence).is_some_and(|later| later <= now)
    }
}

/// Add `jitter_ms` to `occurrence`, never pushing it past `notAfter`.
pub fn apply_jitter(job: &JobDefinition, occurrence: DateTime<Utc>, jitter_ms: u64) -> NextDue {
    let mut due = occurrence + Duration::milliseconds(jitter_ms as i64);
    if let Some(na) = job.not_after {
        if due > na {
            due = na.max(occurrence);
        }
    }
    NextDue { occurrence, due }
}
