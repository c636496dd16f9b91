//! In-process store backing both collaborator traits.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{ChallengeStore, CompletionRecord, CompletionStore, DayRange};
use crate::challenge::ChallengeArtifact;
use crate::clock::DayKey;
use crate::error::DatabaseError;

type DayMap<V> = HashMap<String, BTreeMap<DayKey, V>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    completions: RwLock<DayMap<CompletionRecord>>,
    challenges: RwLock<DayMap<ChallengeArtifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn completion_count(&self, user_id: &str) -> usize {
        self.completions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl CompletionStore for MemoryStore {
    async fn query(
        &self,
        user_id: &str,
        range: DayRange,
    ) -> Result<Vec<CompletionRecord>, DatabaseError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.completions.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard
            .get(user_id)
            .map(|days| {
                days.range(range.start..=range.end)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record(&self, record: CompletionRecord) -> Result<(), DatabaseError> {
        let mut guard = self.completions.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.day_key, record);
        Ok(())
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn load(
        &self,
        user_id: &str,
        day_key: DayKey,
    ) -> Result<Option<ChallengeArtifact>, DatabaseError> {
        let guard = self.challenges.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(user_id).and_then(|days| days.get(&day_key)).cloned())
    }

    async fn save(&self, artifact: &ChallengeArtifact) -> Result<(), DatabaseError> {
        let mut guard = self.challenges.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(artifact.user_id.clone())
            .or_default()
            .insert(artifact.day_key, artifact.clone());
        Ok(())
    }
}
