pub mod auth;
pub mod challenge;
pub mod config;
pub mod log;
pub mod progress;

use std::sync::Arc;

use dayring_core::storage::GeneratorKind;
use dayring_core::{
    ChallengeEngine, Config, ConfigProfileSource, ContentGenerator, CoreError, Database,
    HttpGenerator, ProgressEngine, SystemClock, TemplateGenerator,
};

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Everything a command needs, opened from the default locations.
pub struct App {
    pub config: Config,
    pub db: Arc<Database>,
    clock: Arc<SystemClock>,
}

impl App {
    pub fn open() -> Result<Self, CoreError> {
        Ok(Self {
            config: Config::load()?,
            db: Arc::new(Database::open()?),
            clock: Arc::new(SystemClock),
        })
    }

    /// Progress engine that re-reads the config file on `ProfileChanged`.
    pub fn progress_engine(&self) -> Result<ProgressEngine, CoreError> {
        let source = ConfigProfileSource::default_location()?;
        Ok(ProgressEngine::with_policy(
            self.db.clone(),
            self.clock.clone(),
            self.config.buffer.clone(),
        )
        .with_profile_source(Arc::new(source)))
    }

    pub fn challenge_engine(&self) -> Result<ChallengeEngine, CoreError> {
        let generator: Arc<dyn ContentGenerator> = match self.config.generator.kind {
            GeneratorKind::Template => Arc::new(TemplateGenerator::new()),
            GeneratorKind::Http => Arc::new(HttpGenerator::from_config(&self.config.generator)?),
        };
        Ok(ChallengeEngine::new(
            generator,
            self.db.clone(),
            self.clock.clone(),
        ))
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CommandResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
