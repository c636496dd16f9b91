//! # Dayring Core Library
//!
//! Day-keyed consistency engine for a habit tracker. It turns a log of
//! per-day completion records into a single goal-progress fraction, and
//! manages a once-per-day generated challenge.
//!
//! ## Architecture
//!
//! - **Clock keying**: timestamps map to calendar [`DayKey`]s in local time
//! - **Recompute coordination**: a generation counter drops results of
//!   superseded computations and keeps the last good value on failure
//! - **Progress**: completion fraction with buffer-day tolerance
//! - **Challenges**: single-flight generation per user and day, fire-once
//!   completion, idempotent task linking
//! - **Storage**: in-memory and SQLite stores, TOML configuration
//!
//! ## Key Components
//!
//! - [`ProgressEngine`]: publishes [`ProgressResult`]s for one profile
//! - [`ChallengeEngine`]: owns today's [`ChallengeArtifact`] per user
//! - [`RecomputeCoordinator`]: monotonic publish primitive shared by both
//! - [`EventBus`]: typed invalidation events
//!
//! Engines are plain values wired up by the caller; nothing here is global.

pub mod challenge;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod profile;
pub mod progress;
pub mod storage;

pub use challenge::{
    ChallengeArtifact, ChallengeDraft, ChallengeEngine, ChallengeKind, ChallengeSignal,
    ContentGenerator, HttpGenerator, TemplateGenerator,
};
pub use clock::{Clock, DayKey, ManualClock, SystemClock};
pub use coordinator::{Published, RecomputeCoordinator, Recomputed};
pub use error::{ConfigError, CoreError, DatabaseError, EngineError, GeneratorError, Result};
pub use events::{Event, EventBus};
pub use profile::{ProfileField, ProfileSnapshot, ProfileSource};
pub use progress::{compute_progress, GoalSpec, ProgressEngine, ProgressResult};
pub use storage::{
    ChallengeStore, CompletionRecord, CompletionStore, Config, ConfigProfileSource, Database,
    DayRange, MemoryStore,
};
