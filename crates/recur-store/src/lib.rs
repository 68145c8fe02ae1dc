//! `recur-store`: durable, transactional persistence on SQLite.
//!
//! # Tables
//!
//! | Table        | Key        | Notes                                               |
//! |--------------|------------|-----------------------------------------------------|
//! | `jobs`       | `id`       | full definition as JSON; upsert never re-inserts     |
//! | `schedules`  | `job_id`   | derived cache, 1:1 with `jobs`                       |
//! | `runs`       | `id`       | immutable once finished                              |
//! | `run_events` | rowid      | append-only, monotonic timestamps per run            |
//! | `locks`      | `resource` | `UNIQUE(resource)` is the mutual-exclusion primitive |
//!
//! Deleting a job cascades through `schedules`, `runs` and `run_events` via
//! foreign keys; its locks are removed in the same transaction.

pub mod db;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::Store;
