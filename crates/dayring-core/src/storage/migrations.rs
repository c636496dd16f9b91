//! Schema steps for the dayring database.
//!
//! Each step runs once, inside its own transaction, and bumps
//! `PRAGMA user_version` on commit. Opening an up-to-date database is a no-op.

use rusqlite::{Connection, Result as SqliteResult};
use tracing::debug;

/// Ordered schema steps; step `n` (1-based) brings the database to version `n`.
const STEPS: &[(&str, &str)] = &[
    (
        // `(user_id, day_key)` keys the log so re-logging a day overwrites it.
        "completion log and task list",
        "CREATE TABLE IF NOT EXISTS completions (
            user_id    TEXT NOT NULL,
            day_key    TEXT NOT NULL,
            completed  INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, day_key)
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL,
            title               TEXT NOT NULL,
            source_challenge_id TEXT,
            created_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);",
    ),
    (
        "daily challenge artifacts",
        "CREATE TABLE IF NOT EXISTS challenges (
            user_id        TEXT NOT NULL,
            day_key        TEXT NOT NULL,
            id             TEXT NOT NULL,
            title          TEXT NOT NULL,
            subtitle       TEXT NOT NULL DEFAULT '',
            emoji          TEXT NOT NULL DEFAULT '',
            kind           TEXT NOT NULL,
            target_value   INTEGER NOT NULL,
            completed      INTEGER NOT NULL DEFAULT 0,
            linked_task_id TEXT,
            toast_shown    INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, day_key)
        );",
    ),
];

/// Version a fully migrated database reports.
pub fn latest_version() -> u32 {
    u32::try_from(STEPS.len()).unwrap_or(u32::MAX)
}

/// Version currently recorded in the database file.
///
/// # Errors
/// Returns an error if the pragma cannot be read.
pub fn current_version(conn: &Connection) -> SqliteResult<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Run every step newer than the recorded version.
///
/// # Errors
/// Returns the first failing step's error; earlier steps stay committed.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    let from = current_version(conn)?;
    for (version, (label, sql)) in (1u32..).zip(STEPS) {
        if version <= from {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        debug!(version, label, "applied schema step");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reaches_latest_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        migrate(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('completions', 'tasks', 'challenges')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn rerunning_keeps_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO completions (user_id, day_key, completed, updated_at)
             VALUES ('sam', '2024-01-01', 1, '2024-01-01T08:00:00Z')",
            [],
        )
        .unwrap();

        migrate(&conn).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM completions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
