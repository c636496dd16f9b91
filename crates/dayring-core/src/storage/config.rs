//! TOML-based application configuration.
//!
//! Stores:
//! - The active profile (goal, start date, target, biometric inputs)
//! - Buffer-day defaults
//! - Which content generator to use and how to reach it
//! - Event bus sizing
//!
//! Configuration is stored at `~/.config/dayring/config.toml`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::error::{ConfigError, CoreError};
use crate::profile::{ProfileSnapshot, ProfileSource};

/// Buffer-day defaults: `max(minimum_days, round(target_days * ratio))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_ratio")]
    pub ratio: f64,
    #[serde(default = "default_buffer_minimum")]
    pub minimum_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    /// Offline catalogue.
    Template,
    /// Remote JSON endpoint.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_kind")]
    pub kind: GeneratorKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/dayring/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_profile")]
    pub profile: ProfileSnapshot,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

fn default_buffer_ratio() -> f64 {
    0.1
}
fn default_buffer_minimum() -> u32 {
    3
}
fn default_generator_kind() -> GeneratorKind {
    GeneratorKind::Template
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_channel_capacity() -> usize {
    256
}
fn default_profile() -> ProfileSnapshot {
    ProfileSnapshot::new("local")
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            ratio: default_buffer_ratio(),
            minimum_days: default_buffer_minimum(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            kind: default_generator_kind(),
            endpoint: String::new(),
            model: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            buffer: BufferConfig::default(),
            generator: GeneratorConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

/// `profile.target_days` -> `/profile/target_days`.
fn pointer(key: &str) -> Option<String> {
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return None;
    }
    Some(format!("/{}", key.replace('.', "/")))
}

/// Parse `raw` into the JSON shape of the value it replaces.
///
/// Unset optional fields (`null`) take a number if `raw` looks like one and
/// a string otherwise; `none` clears numbers and optionals.
fn parse_like(current: &Value, raw: &str) -> Result<Value, String> {
    let clear = raw.eq_ignore_ascii_case("none");
    let number = || -> Option<Value> {
        raw.parse::<u64>()
            .ok()
            .map(Value::from)
            .or_else(|| raw.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number))
    };

    match current {
        Value::Bool(_) => raw.parse::<bool>().map(Value::Bool).map_err(|e| e.to_string()),
        Value::Number(_) | Value::Null if clear => Ok(Value::Null),
        Value::Number(_) => number().ok_or_else(|| format!("cannot parse '{raw}' as number")),
        Value::Null => Ok(number().unwrap_or_else(|| Value::String(raw.to_string()))),
        Value::Object(_) | Value::Array(_) => serde_json::from_str(raw).map_err(|e| e.to_string()),
        Value::String(_) => Ok(Value::String(raw.to_string())),
    }
}

impl Config {
    /// Default location under the data directory.
    ///
    /// # Errors
    /// Returns an error if the data directory cannot be created.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load from `path`, writing defaults there if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// default config cannot be written.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    /// Persist to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        match json.pointer(&pointer(key)?)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key, in memory only.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value does not fit the
    /// field.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let path = pointer(key).ok_or_else(unknown)?;
        let json = serde_json::to_value(&*self).map_err(|e| invalid(e.to_string()))?;
        let current = json.pointer(&path).ok_or_else(unknown)?;

        let mut candidates = vec![parse_like(current, value).map_err(invalid)?];
        // unset optional text fields may still receive numeric-looking input
        if current.is_null() && !candidates[0].is_string() && !candidates[0].is_null() {
            candidates.push(Value::String(value.to_string()));
        }

        let mut last_error = None;
        for candidate in candidates {
            let mut attempt = json.clone();
            if let Some(slot) = attempt.pointer_mut(&path) {
                *slot = candidate;
            }
            match serde_json::from_value::<Config>(attempt) {
                Ok(updated) => {
                    *self = updated;
                    return Ok(());
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        Err(invalid(last_error.unwrap_or_default()))
    }
}

/// Reads the profile section of a config file on every call.
#[derive(Debug, Clone)]
pub struct ConfigProfileSource {
    path: PathBuf,
}

impl ConfigProfileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Source backed by the default config location.
    ///
    /// # Errors
    /// Returns an error if the data directory cannot be resolved.
    pub fn default_location() -> Result<Self, ConfigError> {
        Config::default_path().map(Self::new)
    }
}

#[async_trait]
impl ProfileSource for ConfigProfileSource {
    async fn load_profile(&self, user_id: &str) -> Result<Option<ProfileSnapshot>, CoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        Ok(Some(config.profile).filter(|p| p.user_id == user_id))
    }
}
