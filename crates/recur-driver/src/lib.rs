//! `recur-driver`: the polling loop and job management surface.
//!
//! A [`Driver`] owns one store, scheduler and runner. Each tick it purges
//! expired locks, finalizes runs abandoned by dead processes, and executes
//! whatever [`Scheduler::get_pending_runs`](recur_scheduler::Scheduler::get_pending_runs)
//! hands out, up to `runner.max_concurrent_runs` at a time.

pub mod driver;
pub mod error;

pub use driver::{Driver, JobOverview, TickSummary};
pub use error::{DriverError, Result};
