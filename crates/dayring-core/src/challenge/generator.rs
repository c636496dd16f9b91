//! Content generators for daily challenges.
//!
//! The engine calls a generator at most once per generation cycle and never
//! retries; a failed call surfaces as `GenerationFailed`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use url::Url;

use super::artifact::{ChallengeDraft, ChallengeKind};
use crate::clock::DayKey;
use crate::error::GeneratorError;
use crate::profile::ProfileSnapshot;
use crate::storage::GeneratorConfig;

/// External content-generation collaborator.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_challenge(
        &self,
        profile: &ProfileSnapshot,
        day_key: DayKey,
    ) -> Result<ChallengeDraft, GeneratorError>;
}

/// Thin wrapper around the OS keyring for the generator API key.
pub mod credentials {
    use crate::error::GeneratorError;

    const SERVICE: &str = "dayring";
    const API_KEY: &str = "generator_api_key";

    pub fn get() -> Result<Option<String>, GeneratorError> {
        let entry = keyring::Entry::new(SERVICE, API_KEY)?;
        match entry.get_password() {
            Ok(pw) => Ok(Some(pw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set(value: &str) -> Result<(), GeneratorError> {
        let entry = keyring::Entry::new(SERVICE, API_KEY)?;
        entry.set_password(value)?;
        Ok(())
    }

    pub fn delete() -> Result<(), GeneratorError> {
        let entry = keyring::Entry::new(SERVICE, API_KEY)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

const CATALOGUE: &[(&str, &str, &str, ChallengeKind, u32)] = &[
    ("Step it up", "Walk until the counter says so", "🚶", ChallengeKind::Steps, 8000),
    ("Long way round", "Take the scenic route today", "🗺️", ChallengeKind::Steps, 10000),
    ("Quick burn", "A short bodyweight circuit", "🔥", ChallengeKind::Workout, 20),
    ("Core check", "Planks, crunches, repeat", "💪", ChallengeKind::Workout, 15),
    ("Glass half full", "Keep the water coming", "💧", ChallengeKind::Hydration, 8),
    ("Breathe out", "Sit still, breathe slowly", "🧘", ChallengeKind::Mindfulness, 10),
    ("Green plate", "Vegetables in every meal", "🥦", ChallengeKind::Nutrition, 3),
    ("Lights out", "In bed before the usual time", "😴", ChallengeKind::Sleep, 8),
];

/// Offline generator picking from a fixed catalogue.
///
/// The pick is seeded by user, day and a per-instance call counter, so a
/// refresh on the same day usually lands on a different entry.
#[derive(Debug, Default)]
pub struct TemplateGenerator {
    calls: AtomicU64,
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate_challenge(
        &self,
        profile: &ProfileSnapshot,
        day_key: DayKey,
    ) -> Result<ChallengeDraft, GeneratorError> {
        let nonce = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hasher = DefaultHasher::new();
        profile.user_id.hash(&mut hasher);
        day_key.hash(&mut hasher);
        nonce.hash(&mut hasher);
        let index = (hasher.finish() % CATALOGUE.len() as u64) as usize;

        let (title, subtitle, emoji, kind, target_value) = CATALOGUE[index];
        Ok(ChallengeDraft {
            title: title.to_string(),
            subtitle: subtitle.to_string(),
            emoji: emoji.to_string(),
            kind,
            target_value,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DraftEnvelope {
    Wrapped { challenge: ChallengeDraft },
    Bare(ChallengeDraft),
}

/// Generator backed by a remote JSON endpoint.
///
/// POSTs a profile snapshot and expects a challenge draft back, either bare
/// or under a `challenge` key.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    /// # Errors
    /// `NotConfigured` if `endpoint` isn't a valid URL; `Request` if the HTTP
    /// client cannot be built.
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, GeneratorError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| GeneratorError::NotConfigured(format!("endpoint '{endpoint}': {e}")))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Build from config, reading the API key from the OS keyring if present.
    ///
    /// # Errors
    /// See [`HttpGenerator::new`]; keyring failures are `Credentials`.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        if config.endpoint.trim().is_empty() {
            return Err(GeneratorError::NotConfigured("generator.endpoint is empty".into()));
        }
        let generator = Self::new(
            &config.endpoint,
            &config.model,
            Duration::from_secs(config.timeout_secs.max(1)),
        )?;
        Ok(match credentials::get()? {
            Some(key) => generator.with_api_key(key),
            None => generator,
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpGenerator {
    async fn generate_challenge(
        &self,
        profile: &ProfileSnapshot,
        day_key: DayKey,
    ) -> Result<ChallengeDraft, GeneratorError> {
        let body = json!({
            "model": self.model,
            "day_key": day_key,
            "profile": profile,
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GeneratorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        let draft = match serde_json::from_str::<DraftEnvelope>(&text)
            .map_err(|e| GeneratorError::Malformed(e.to_string()))?
        {
            DraftEnvelope::Wrapped { challenge } => challenge,
            DraftEnvelope::Bare(draft) => draft,
        };

        if draft.title.trim().is_empty() {
            return Err(GeneratorError::Malformed("empty title".into()));
        }
        if draft.target_value == 0 {
            return Err(GeneratorError::Malformed("target_value must be positive".into()));
        }
        Ok(draft)
    }
}
