//! SQLite-backed storage.
//!
//! Provides persistent storage for:
//! - Per-day completion records
//! - Daily challenge artifacts
//! - The downstream task list challenges get linked into

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{data_dir, migrations, ChallengeStore, CompletionRecord, CompletionStore, DayRange};
use crate::challenge::ChallengeArtifact;
use crate::clock::DayKey;
use crate::error::DatabaseError;

/// A task created by linking a challenge into the task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub source_challenge_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// SQLite database for completions, challenges and tasks.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at `~/.config/dayring/dayring.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, DatabaseError> {
        let dir = data_dir().map_err(|e| DatabaseError::Unavailable(e.to_string()))?;
        Self::open_at(dir.join("dayring.db"))
    }

    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    /// Returns an error if migration fails.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DatabaseError> {
        migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a task row and return its id.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn create_task(
        &self,
        user_id: &str,
        title: &str,
        source_challenge_id: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT INTO tasks (id, user_id, title, source_challenge_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, user_id, title, source_challenge_id, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    /// All tasks for `user_id`, oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn list_tasks(&self, user_id: &str) -> Result<Vec<TaskRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, source_challenge_id, created_at
             FROM tasks WHERE user_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (id, user_id, title, source_challenge_id, created_at) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| DatabaseError::CorruptRow {
                    table: "tasks",
                    message: e.to_string(),
                })?
                .with_timezone(&Utc);
            tasks.push(TaskRecord {
                id,
                user_id,
                title,
                source_challenge_id,
                created_at,
            });
        }
        Ok(tasks)
    }
}

fn parse_day(table: &'static str, raw: &str) -> Result<DayKey, DatabaseError> {
    raw.parse().map_err(|e: chrono::ParseError| DatabaseError::CorruptRow {
        table,
        message: format!("bad day_key '{raw}': {e}"),
    })
}

#[async_trait]
impl CompletionStore for Database {
    async fn query(
        &self,
        user_id: &str,
        range: DayRange,
    ) -> Result<Vec<CompletionRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT day_key, completed, updated_at FROM completions
             WHERE user_id = ?1 AND day_key >= ?2 AND day_key <= ?3
             ORDER BY day_key",
        )?;
        let rows = stmt.query_map(
            params![user_id, range.start.to_string(), range.end.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (day_key, completed, updated_at) = row?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| DatabaseError::CorruptRow {
                    table: "completions",
                    message: e.to_string(),
                })?;
            records.push(CompletionRecord {
                user_id: user_id.to_string(),
                day_key: parse_day("completions", &day_key)?,
                completed,
                updated_at,
            });
        }
        Ok(records)
    }

    async fn record(&self, record: CompletionRecord) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO completions (user_id, day_key, completed, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, day_key) DO UPDATE SET
                completed = excluded.completed,
                updated_at = excluded.updated_at",
            params![
                record.user_id,
                record.day_key.to_string(),
                record.completed,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ChallengeStore for Database {
    async fn load(
        &self,
        user_id: &str,
        day_key: DayKey,
    ) -> Result<Option<ChallengeArtifact>, DatabaseError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, title, subtitle, emoji, kind, target_value, completed,
                        linked_task_id, toast_shown
                 FROM challenges WHERE user_id = ?1 AND day_key = ?2",
                params![user_id, day_key.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, bool>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, title, subtitle, emoji, kind, target_value, completed, linked_task_id, toast_shown)) =
            row
        else {
            return Ok(None);
        };

        let kind = kind.parse().map_err(|message| DatabaseError::CorruptRow {
            table: "challenges",
            message,
        })?;

        Ok(Some(ChallengeArtifact {
            id,
            user_id: user_id.to_string(),
            day_key,
            title,
            subtitle,
            emoji,
            kind,
            target_value,
            completed,
            linked_task_id,
            toast_shown,
        }))
    }

    async fn save(&self, artifact: &ChallengeArtifact) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO challenges
                (user_id, day_key, id, title, subtitle, emoji, kind, target_value,
                 completed, linked_task_id, toast_shown)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                artifact.user_id,
                artifact.day_key.to_string(),
                artifact.id,
                artifact.title,
                artifact.subtitle,
                artifact.emoji,
                artifact.kind.as_str(),
                artifact.target_value,
                artifact.completed,
                artifact.linked_task_id,
                artifact.toast_shown,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{ChallengeDraft, ChallengeKind};

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn completion_upsert_keeps_one_row_per_day() {
        let db = Database::open_memory().unwrap();
        db.record(CompletionRecord::new("u1", day("2024-05-01"), false))
            .await
            .unwrap();
        db.record(CompletionRecord::new("u1", day("2024-05-01"), true))
            .await
            .unwrap();
        db.record(CompletionRecord::new("u1", day("2024-05-03"), true))
            .await
            .unwrap();

        let rows = db
            .query("u1", DayRange::new(day("2024-05-01"), day("2024-05-02")))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].completed);
    }

    #[tokio::test]
    async fn challenge_save_replaces_previous_artifact() {
        let db = Database::open_memory().unwrap();
        let draft = ChallengeDraft {
            title: "Breathe".into(),
            subtitle: "Ten quiet minutes".into(),
            emoji: "🧘".into(),
            kind: ChallengeKind::Mindfulness,
            target_value: 10,
        };
        let first = ChallengeArtifact::from_draft("u1", day("2024-05-01"), draft.clone());
        db.save(&first).await.unwrap();

        let mut second = ChallengeArtifact::from_draft("u1", day("2024-05-01"), draft);
        second.linked_task_id = Some("t-1".into());
        db.save(&second).await.unwrap();

        let loaded = db.load("u1", day("2024-05-01")).await.unwrap().unwrap();
        assert_eq!(loaded, second);
        assert!(db.load("u1", day("2024-05-02")).await.unwrap().is_none());
    }

    #[test]
    fn tasks_round_trip_through_table() {
        let db = Database::open_memory().unwrap();
        let id = db.create_task("u1", "Walk 8000 steps", Some("c-1")).unwrap();
        let tasks = db.list_tasks("u1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].source_challenge_id.as_deref(), Some("c-1"));
        assert!(db.list_tasks("u2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dayring.db");
        {
            let db = Database::open_at(&path).unwrap();
            db.record(CompletionRecord::new("u1", day("2024-05-01"), true))
                .await
                .unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        let rows = db
            .query("u1", DayRange::new(day("2024-05-01"), day("2024-05-01")))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
