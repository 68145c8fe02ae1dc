use recur_core::CoreError;
use recur_runner::RunnerError;
use recur_scheduler::SchedulerError;
use recur_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Invalid inputs: {0}")]
    InvalidInputs(String),
}

impl DriverError {
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::Core(e) => e.code(),
            DriverError::Store(e) => e.code(),
            DriverError::Scheduler(e) => e.code(),
            DriverError::Runner(e) => e.code(),
            DriverError::InvalidInputs(_) => "INVALID_INPUTS",
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
