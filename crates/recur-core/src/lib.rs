//! `recur-core`: shared data model for the recur job engine.
//!
//! Everything above the store speaks these types: job definitions parsed from
//! YAML/JSON files, schedule rows, run records, run events and locks. Cron
//! evaluation lives here too so that definition validation and the scheduler
//! agree on what a valid expression is.

pub mod config;
pub mod cron;
pub mod definition;
pub mod error;
pub mod time;
pub mod types;

pub use error::{CoreError, FieldError, Result, ValidationError};
pub use types::{
    AlertPolicy, ConcurrencyPolicy, EventLevel, JobDefinition, Lock, NetworkScope,
    ResourceLimits, ResourceUsage, RetryPolicy, RetryStrategy, RunEvent, RunMetadata, RunState,
    RunTrigger, ScheduleState,
};
