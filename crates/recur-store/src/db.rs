use rusqlite::Connection;

use crate::error::Result;

/// Busy timeout applied to every connection so several processes can share
/// one database file without surfacing `SQLITE_BUSY` on short contention.
pub const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Per-connection pragmas. `foreign_keys` is connection-scoped in SQLite, so
/// this must run on every connection, not just the first.
pub fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    // WAL is a no-op (returns "memory") for in-memory databases.
    conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
    Ok(())
}

/// Initialise the store schema in `conn`.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            version     INTEGER NOT NULL,
            name        TEXT    NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1,
            concurrency TEXT    NOT NULL,
            priority    INTEGER NOT NULL DEFAULT 0,
            definition  TEXT    NOT NULL,   -- JSON-encoded JobDefinition
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedules (
            job_id          TEXT NOT NULL PRIMARY KEY
                            REFERENCES jobs(id) ON DELETE CASCADE,
            next_due        TEXT,           -- NULL means suppressed
            next_occurrence TEXT,
            last_scheduled  TEXT,
            last_success    TEXT,
            last_attempt    TEXT,
            timezone        TEXT NOT NULL
        ) STRICT;

        -- Efficient polling: SELECT … WHERE next_due <= ?
        CREATE INDEX IF NOT EXISTS idx_schedules_next_due ON schedules (next_due);

        CREATE TABLE IF NOT EXISTS runs (
            id              TEXT    NOT NULL PRIMARY KEY,
            job_id          TEXT    NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            scheduled_at    TEXT    NOT NULL,
            started_at      TEXT,
            completed_at    TEXT,
            state           TEXT    NOT NULL,
            attempt         INTEGER NOT NULL DEFAULT 0,
            trigger_kind    TEXT    NOT NULL,
            error_code      TEXT,
            error_message   TEXT,
            usage           TEXT    NOT NULL,   -- JSON-encoded ResourceUsage
            inputs_override TEXT,               -- JSON object or NULL
            output_hash     TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_runs_state_scheduled ON runs (state, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_runs_job ON runs (job_id, scheduled_at DESC);

        CREATE TABLE IF NOT EXISTS run_events (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id    TEXT    NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            timestamp TEXT    NOT NULL,
            level     TEXT    NOT NULL,
            event     TEXT    NOT NULL,
            message   TEXT    NOT NULL,
            data      TEXT              -- JSON or NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events (run_id, timestamp, id);

        -- UNIQUE(resource) is what makes acquire_lock an atomic insert.
        CREATE TABLE IF NOT EXISTS locks (
            id          TEXT NOT NULL PRIMARY KEY,
            resource    TEXT NOT NULL UNIQUE,
            owner       TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at  TEXT            -- NULL means held until released
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_locks_owner ON locks (owner);
        ",
    )?;
    Ok(())
}
