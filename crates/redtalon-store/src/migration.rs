//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number.  The current
//! version is tracked in a `_migrations` table so migrations are idempotent
//! and only run once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "coordination schema — tasks, messages, locks, findings",
    sql: r#"
        CREATE TABLE tasks (
            id           TEXT PRIMARY KEY,
            description  TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending'
                         CHECK(status IN ('pending','running','complete','failed')),
            assignee     TEXT,
            dependencies TEXT NOT NULL DEFAULT '[]',
            priority     INTEGER NOT NULL DEFAULT 0,
            result       TEXT,
            error        TEXT,
            created_at   INTEGER NOT NULL,
            started_at   INTEGER,
            completed_at INTEGER
        );
        CREATE INDEX idx_tasks_status ON tasks(status);

        CREATE TABLE messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            from_agent  TEXT NOT NULL,
            to_agent    TEXT NOT NULL,
            kind        TEXT NOT NULL,
            payload     TEXT NOT NULL DEFAULT '{}',
            ts          INTEGER NOT NULL,
            read_status INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_messages_recipient ON messages(to_agent, read_status);

        CREATE TABLE locks (
            resource_id TEXT PRIMARY KEY,
            owner       TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        );

        CREATE TABLE findings (
            id          TEXT PRIMARY KEY,
            phase       TEXT NOT NULL,
            title       TEXT NOT NULL,
            severity    TEXT NOT NULL
                        CHECK(severity IN ('critical','high','medium','low','info')),
            description TEXT NOT NULL,
            evidence    TEXT NOT NULL DEFAULT '[]',
            metadata    TEXT,
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX idx_findings_severity ON findings(severity);
    "#,
}];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function — call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing"
            );
        }
    }

    #[test]
    fn run_all_creates_schema() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        for table in ["tasks", "messages", "locks", "findings"] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "table {table} should exist");
        }
    }

    #[test]
    fn run_all_twice_is_noop() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
    }

    #[test]
    fn status_check_constraint_enforced() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let err = conn.execute(
            "INSERT INTO tasks (id, description, status, created_at) VALUES ('t1', 'x', 'bogus', 0)",
            [],
        );
        assert!(err.is_err());
    }
}
