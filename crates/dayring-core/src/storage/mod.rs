//! Storage collaborators.
//!
//! The engines only talk to storage through [`CompletionStore`] and
//! [`ChallengeStore`]. [`MemoryStore`] backs tests and embedders;
//! [`Database`] is the SQLite backend used by the CLI.

mod config;
pub mod database;
pub mod memory;
pub mod migrations;

pub use config::{
    BufferConfig, Config, ConfigProfileSource, EventsConfig, GeneratorConfig, GeneratorKind,
};
pub use database::Database;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::challenge::ChallengeArtifact;
use crate::clock::DayKey;
use crate::error::{ConfigError, DatabaseError};

/// One row per user per calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub user_id: String,
    pub day_key: DayKey,
    pub completed: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl CompletionRecord {
    pub fn new(user_id: impl Into<String>, day_key: DayKey, completed: bool) -> Self {
        Self {
            user_id: user_id.into(),
            day_key,
            completed,
            updated_at: Utc::now(),
        }
    }
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub start: DayKey,
    pub end: DayKey,
}

impl DayRange {
    pub fn new(start: DayKey, end: DayKey) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, day: DayKey) -> bool {
        self.start <= day && day <= self.end
    }

    /// Number of days covered; zero when `end < start`.
    pub fn len(&self) -> i64 {
        (self.end.days_since(self.start) + 1).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-user, per-day completion records.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    /// All records for `user_id` whose day falls inside `range`.
    async fn query(
        &self,
        user_id: &str,
        range: DayRange,
    ) -> Result<Vec<CompletionRecord>, DatabaseError>;

    /// Insert or overwrite the record for `(user_id, day_key)`.
    async fn record(&self, record: CompletionRecord) -> Result<(), DatabaseError>;
}

/// Per-user, per-day challenge artifacts.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn load(
        &self,
        user_id: &str,
        day_key: DayKey,
    ) -> Result<Option<ChallengeArtifact>, DatabaseError>;

    /// Replace whatever artifact is stored for the artifact's `(user_id, day_key)`.
    async fn save(&self, artifact: &ChallengeArtifact) -> Result<(), DatabaseError>;
}

/// Returns `~/.config/dayring[-dev]/` based on DAYRING_ENV.
///
/// Set DAYRING_ENV=dev to use the development data directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("DAYRING_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("dayring-dev")
    } else {
        base_dir.join("dayring")
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
