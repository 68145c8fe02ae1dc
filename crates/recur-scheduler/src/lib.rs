//! `recur-scheduler`: turns cron expressions into due runs and decides
//! whether a due run may start.
//!
//! # Concurrency policies
//!
//! | Policy            | Lock on job id | When the lock is taken                          |
//! |-------------------|----------------|-------------------------------------------------|
//! | `allow`           | no             | never; runs overlap freely                      |
//! | `skip`            | yes            | new run is recorded FAILED ("job already running") |
//! | `queue`           | yes            | new run stays DUE until the lock frees (FIFO)   |
//! | `cancel-previous` | yes            | running run is CANCELLED, lock handed over      |
//!
//! Nothing here holds authoritative state: every decision is re-derived from
//! store rows, so any number of processes may run the scheduler against one
//! database.

pub mod admission;
pub mod error;
pub mod next_due;
pub mod scheduler;

pub use admission::Admission;
pub use error::{Result, SchedulerError};
pub use scheduler::Scheduler;
