//! Daily challenge artifact types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::clock::DayKey;

/// What a challenge asks the user to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Steps,
    Workout,
    Hydration,
    Mindfulness,
    Nutrition,
    Sleep,
}

impl ChallengeKind {
    pub const ALL: [ChallengeKind; 6] = [
        ChallengeKind::Steps,
        ChallengeKind::Workout,
        ChallengeKind::Hydration,
        ChallengeKind::Mindfulness,
        ChallengeKind::Nutrition,
        ChallengeKind::Sleep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Steps => "steps",
            ChallengeKind::Workout => "workout",
            ChallengeKind::Hydration => "hydration",
            ChallengeKind::Mindfulness => "mindfulness",
            ChallengeKind::Nutrition => "nutrition",
            ChallengeKind::Sleep => "sleep",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChallengeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown challenge kind: {s}"))
    }
}

/// Generator output before the engine stamps identity and lifecycle flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeDraft {
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub emoji: String,
    pub kind: ChallengeKind,
    pub target_value: u32,
}

/// Today's challenge for one user.
///
/// At most one non-discarded artifact exists per `(user_id, day_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeArtifact {
    pub id: String,
    pub user_id: String,
    pub day_key: DayKey,
    pub title: String,
    pub subtitle: String,
    pub emoji: String,
    pub kind: ChallengeKind,
    pub target_value: u32,
    pub completed: bool,
    /// Downstream task id; set at most once.
    pub linked_task_id: Option<String>,
    /// Whether the completion signal has been emitted.
    pub toast_shown: bool,
}

impl ChallengeArtifact {
    /// Fresh artifact with a new id and all flags cleared.
    pub fn from_draft(user_id: &str, day_key: DayKey, draft: ChallengeDraft) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            day_key,
            title: draft.title,
            subtitle: draft.subtitle,
            emoji: draft.emoji,
            kind: draft.kind,
            target_value: draft.target_value,
            completed: false,
            linked_task_id: None,
            toast_shown: false,
        }
    }

    /// Whether this artifact still belongs to `today`.
    pub fn is_current(&self, today: DayKey) -> bool {
        self.day_key == today
    }
}
