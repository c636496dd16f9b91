//! Core error types for dayring-core.
//!
//! `EngineError` is what the progress and challenge engines surface to their
//! callers. Every variant carries enough context (user, day key, operation)
//! to log it and show a user-facing message; none of them are fatal.

use std::path::PathBuf;
use thiserror::Error;

use crate::clock::DayKey;

/// Umbrella error for callers that do not care which layer failed.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Generator error: {0}")]
    Generator(#[from] GeneratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the progress and challenge engines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Profile lacks the data an operation needs. A short-circuit, not a failure.
    #[error("Insufficient profile data for {operation} (user {user_id})")]
    InsufficientData {
        user_id: String,
        operation: &'static str,
    },

    /// The backing store could not be queried; last-known-good is retained.
    #[error("Store unavailable during {operation} for user {user_id} on {day_key}: {message}")]
    StoreUnavailable {
        user_id: String,
        day_key: DayKey,
        operation: &'static str,
        message: String,
    },

    /// The content generator failed; the day's challenge is back to absent.
    #[error("Challenge generation failed for user {user_id} on {day_key}: {message}")]
    GenerationFailed {
        user_id: String,
        day_key: DayKey,
        message: String,
    },

    /// A recomputation finished after a newer one was requested.
    #[error("Recompute generation {generation} superseded by generation {latest}")]
    RaceDiscarded { generation: u64, latest: u64 },

    /// A refresh was requested while a generation is already in flight.
    #[error("Challenge generation already in progress for user {user_id} on {day_key}")]
    GenerationInProgress { user_id: String, day_key: DayKey },

    /// Complete/link was requested before today's challenge exists.
    #[error("No challenge available for user {user_id} on {day_key}")]
    NoActiveChallenge { user_id: String, day_key: DayKey },

    /// The downstream task factory failed.
    #[error("Linking challenge to a task failed for user {user_id} on {day_key}: {message}")]
    TaskLinkFailed {
        user_id: String,
        day_key: DayKey,
        message: String,
    },
}

impl EngineError {
    /// Whether this error is a short-circuit or internal bookkeeping rather than a failure.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData { .. } | EngineError::RaceDiscarded { .. }
        )
    }
}

/// SQLite store failures.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The file could not be opened or created
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A statement failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A schema step failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Another connection holds the write lock
    #[error("Database is locked")]
    Locked,

    /// Backend cannot be reached at all
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

/// Config file and key errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Unreadable or malformed TOML
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// The value does not fit the field
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Data directory could not be resolved or created
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Content generator errors.
#[derive(Error, Debug)]
pub enum GeneratorError {
    /// Transport-level failure
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("Generator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body was not a usable challenge
    #[error("Malformed generator response: {0}")]
    Malformed(String),

    /// Endpoint or credentials missing
    #[error("Generator not configured: {0}")]
    NotConfigured(String),

    /// OS keyring failure
    #[error("Credential store error: {0}")]
    Credentials(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode::{DatabaseBusy, DatabaseLocked};
        match err.sqlite_error_code() {
            Some(DatabaseBusy | DatabaseLocked) => DatabaseError::Locked,
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

impl From<keyring::Error> for GeneratorError {
    fn from(err: keyring::Error) -> Self {
        GeneratorError::Credentials(err.to_string())
    }
}

/// Shorthand for results carrying [`CoreError`].
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
