use recur_core::RunState;
use recur_scheduler::SchedulerError;
use recur_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    /// The run is not DUE, or another process claimed it first.
    #[error("Run {id} is {state}, not DUE")]
    NotDue { id: String, state: RunState },

    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::Store(e) => e.code(),
            RunnerError::Scheduler(e) => e.code(),
            RunnerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            RunnerError::RunNotFound { .. } => "RUN_NOT_FOUND",
            RunnerError::NotDue { .. } => "RUN_NOT_DUE",
            RunnerError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
