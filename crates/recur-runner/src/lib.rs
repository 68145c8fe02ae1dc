//! `recur-runner`: drives one run through its state machine:
//! admission, lock, executor call under a wall-clock cap, outcome
//! classification, artifacts, retries.

pub mod artifacts;
pub mod error;
pub mod executor;
pub mod network;
pub mod retry;
pub mod runner;

pub use artifacts::ArtifactStore;
pub use error::{Result, RunnerError};
pub use executor::{
    ExecutionOutput, ExecutionRequest, Executor, ExecutorError, ProcessExecutor,
    UnconfiguredExecutor,
};
pub use network::NetworkGate;
pub use runner::Runner;
