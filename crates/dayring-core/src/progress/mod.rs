//! Goal progress with buffer-day tolerance.
//!
//! A goal runs for `target_days` calendar days from `start_date`. Up to
//! `buffer_days` missed days are free: the fraction reaches 1.0 once
//! `max(target_days - buffer_days, 1)` days are completed.
//!
//! The calculation here is pure; [`ProgressEngine`] wraps it with storage
//! access and recompute coordination.

mod engine;

pub use engine::ProgressEngine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::clock::DayKey;
use crate::profile::ProfileSnapshot;
use crate::storage::{BufferConfig, CompletionRecord, DayRange};

/// `max(minimum_days, round(target_days * ratio))`.
pub fn default_buffer_days(target_days: u32, policy: &BufferConfig) -> u32 {
    let scaled = (f64::from(target_days) * policy.ratio.max(0.0)).round();
    let scaled = if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    };
    scaled.max(policy.minimum_days)
}

/// Immutable-per-recompute snapshot of a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSpec {
    start_date: DayKey,
    end_date: DayKey,
    target_days: u32,
    buffer_days: u32,
    buffer_overridden: bool,
}

impl GoalSpec {
    /// Goal with the default buffer policy; `None` when `target_days` is zero
    /// or the window would end past the last representable date.
    pub fn new(start_date: DayKey, target_days: u32) -> Option<Self> {
        Self::with_policy(start_date, target_days, &BufferConfig::default())
    }

    pub fn with_policy(start_date: DayKey, target_days: u32, policy: &BufferConfig) -> Option<Self> {
        let end_date = window_end(start_date, target_days)?;
        Some(Self {
            start_date,
            end_date,
            target_days,
            buffer_days: default_buffer_days(target_days, policy),
            buffer_overridden: false,
        })
    }

    /// Goal for `profile`, honouring an explicit buffer override.
    pub fn from_profile(profile: &ProfileSnapshot, policy: &BufferConfig) -> Option<Self> {
        if !profile.has_minimum_data() {
            return None;
        }
        let goal = Self::with_policy(profile.start_date?, profile.target_days, policy)?;
        Some(match profile.buffer_days {
            Some(days) => goal.with_buffer_days(days),
            None => goal,
        })
    }

    /// Pin the buffer; later target changes will not recompute it.
    pub fn with_buffer_days(mut self, buffer_days: u32) -> Self {
        self.buffer_days = buffer_days;
        self.buffer_overridden = true;
        self
    }

    /// Change the target, re-deriving the buffer unless it was pinned.
    /// Targets [`GoalSpec::new`] would reject are ignored.
    pub fn set_target_days(&mut self, target_days: u32, policy: &BufferConfig) {
        let Some(end_date) = window_end(self.start_date, target_days) else {
            return;
        };
        self.end_date = end_date;
        self.target_days = target_days;
        if !self.buffer_overridden {
            self.buffer_days = default_buffer_days(target_days, policy);
        }
    }

    pub fn start_date(&self) -> DayKey {
        self.start_date
    }

    pub fn target_days(&self) -> u32 {
        self.target_days
    }

    pub fn buffer_days(&self) -> u32 {
        self.buffer_days
    }

    pub fn is_buffer_overridden(&self) -> bool {
        self.buffer_overridden
    }

    /// Completed days needed for a full ring.
    pub fn required_for_full_credit(&self) -> u32 {
        self.target_days.saturating_sub(self.buffer_days).max(1)
    }

    /// `[start_date, start_date + target_days - 1]`.
    pub fn window(&self) -> DayRange {
        DayRange::new(self.start_date, self.end_date)
    }
}

fn window_end(start_date: DayKey, target_days: u32) -> Option<DayKey> {
    if target_days == 0 {
        return None;
    }
    start_date.add_days(i64::from(target_days) - 1)
}

/// Derived, disposable progress snapshot. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressResult {
    pub completed_days: u32,
    pub elapsed_days: u32,
    pub target_days: u32,
    pub fraction: f64,
}

impl ProgressResult {
    pub fn zeroed(target_days: u32) -> Self {
        Self {
            target_days,
            ..Default::default()
        }
    }

    pub fn percent(&self) -> u32 {
        (self.fraction * 100.0).round() as u32
    }
}

/// Progress for `goal` as of `today`, given the user's completion records.
///
/// Records outside the goal window or not marked completed are ignored, and
/// a day is counted once even if the store hands back duplicates.
pub fn compute_progress(
    goal: &GoalSpec,
    today: DayKey,
    records: &[CompletionRecord],
) -> ProgressResult {
    let elapsed = today.days_since(goal.start_date()).max(0);
    let elapsed_days = u32::try_from(elapsed).unwrap_or(u32::MAX);

    let window = goal.window();
    let completed: BTreeSet<DayKey> = records
        .iter()
        .filter(|r| r.completed && window.contains(r.day_key))
        .map(|r| r.day_key)
        .collect();
    let completed_days = u32::try_from(completed.len()).unwrap_or(u32::MAX);

    let fraction =
        (f64::from(completed_days) / f64::from(goal.required_for_full_credit())).clamp(0.0, 1.0);

    ProgressResult {
        completed_days,
        elapsed_days,
        target_days: goal.target_days(),
        fraction,
    }
}
