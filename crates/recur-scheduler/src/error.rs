use recur_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job's cron expression or timezone cannot be evaluated.
    #[error("Invalid schedule for job {job_id}: {reason}")]
    InvalidSchedule { job_id: String, reason: String },
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Store(e) => e.code(),
            SchedulerError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
