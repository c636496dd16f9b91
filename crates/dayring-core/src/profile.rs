//! Profile snapshot consumed by both engines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::DayKey;
use crate::error::CoreError;

/// Editable profile fields, as carried by `ProfileChanged` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    Goal,
    StartDate,
    TargetDays,
    BufferDays,
    WeightKg,
    HeightCm,
    Age,
    ActivityLevel,
    DisplayName,
    Avatar,
}

impl ProfileField {
    /// Whether a change to this field invalidates the published progress.
    pub fn affects_progress(&self) -> bool {
        !matches!(self, ProfileField::DisplayName | ProfileField::Avatar)
    }
}

/// Point-in-time copy of the user profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub user_id: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub start_date: Option<DayKey>,
    #[serde(default)]
    pub target_days: u32,
    /// Explicit buffer override; `None` means derive it from `target_days`.
    #[serde(default)]
    pub buffer_days: Option<u32>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub height_cm: Option<f64>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub activity_level: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl ProfileSnapshot {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Non-empty goal, a start date, and a positive target.
    pub fn has_minimum_data(&self) -> bool {
        !self.goal.trim().is_empty() && self.start_date.is_some() && self.target_days > 0
    }

    /// Fields whose values differ between `self` and `other`.
    pub fn changed_fields(&self, other: &ProfileSnapshot) -> Vec<ProfileField> {
        let mut changed = Vec::new();
        if self.goal != other.goal {
            changed.push(ProfileField::Goal);
        }
        if self.start_date != other.start_date {
            changed.push(ProfileField::StartDate);
        }
        if self.target_days != other.target_days {
            changed.push(ProfileField::TargetDays);
        }
        if self.buffer_days != other.buffer_days {
            changed.push(ProfileField::BufferDays);
        }
        if self.weight_kg != other.weight_kg {
            changed.push(ProfileField::WeightKg);
        }
        if self.height_cm != other.height_cm {
            changed.push(ProfileField::HeightCm);
        }
        if self.age != other.age {
            changed.push(ProfileField::Age);
        }
        if self.activity_level != other.activity_level {
            changed.push(ProfileField::ActivityLevel);
        }
        if self.display_name != other.display_name {
            changed.push(ProfileField::DisplayName);
        }
        changed
    }
}

/// Where the current profile lives. Read again whenever a
/// `ProfileChanged` event says the cached snapshot is stale.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// The stored profile for `user_id`, or `None` if there is none.
    async fn load_profile(&self, user_id: &str) -> Result<Option<ProfileSnapshot>, CoreError>;
}
