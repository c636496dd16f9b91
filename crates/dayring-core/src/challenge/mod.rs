//! Daily challenge lifecycle.
//!
//! A challenge is generated at most once per user per calendar day, can be
//! completed and linked to a downstream task, and is superseded lazily when
//! the day rolls over.

mod artifact;
mod engine;
mod flight;
mod generator;

pub use artifact::{ChallengeArtifact, ChallengeDraft, ChallengeKind};
pub use engine::{ChallengeEngine, ChallengeSignal};
pub use generator::{credentials, ContentGenerator, HttpGenerator, TemplateGenerator};
