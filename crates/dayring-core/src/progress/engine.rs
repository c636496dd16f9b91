//! Progress engine: recompute triggers, storage access, publishing.

use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{compute_progress, GoalSpec, ProgressResult};
use crate::clock::{Clock, DayKey};
use crate::coordinator::{Published, RecomputeCoordinator, Recomputed};
use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::profile::{ProfileSnapshot, ProfileSource};
use crate::storage::{BufferConfig, CompletionStore};

/// Computes and publishes goal progress for one profile.
///
/// Readers call [`ProgressEngine::latest`] at any time and get the last
/// published value without waiting on anything in flight.
pub struct ProgressEngine {
    store: Arc<dyn CompletionStore>,
    clock: Arc<dyn Clock>,
    policy: BufferConfig,
    profile: RwLock<Option<ProfileSnapshot>>,
    profile_source: Option<Arc<dyn ProfileSource>>,
    coordinator: RecomputeCoordinator<ProgressResult>,
}

impl ProgressEngine {
    pub fn new(store: Arc<dyn CompletionStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_policy(store, clock, BufferConfig::default())
    }

    pub fn with_policy(
        store: Arc<dyn CompletionStore>,
        clock: Arc<dyn Clock>,
        policy: BufferConfig,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            profile: RwLock::new(None),
            profile_source: None,
            coordinator: RecomputeCoordinator::new(),
        }
    }

    /// Re-read the profile from `source` when the bus reports it changed.
    #[must_use]
    pub fn with_profile_source(mut self, source: Arc<dyn ProfileSource>) -> Self {
        self.profile_source = Some(source);
        self
    }

    /// Install `profile` and run the initial recompute.
    ///
    /// # Errors
    /// See [`ProgressEngine::recompute`].
    pub async fn activate(
        &self,
        profile: ProfileSnapshot,
    ) -> Result<Recomputed<ProgressResult>, EngineError> {
        self.store_profile(profile);
        self.recompute().await
    }

    /// Replace the profile, recomputing only if a progress-relevant field changed.
    ///
    /// Returns `None` when nothing relevant changed.
    ///
    /// # Errors
    /// See [`ProgressEngine::recompute`].
    pub async fn update_profile(
        &self,
        profile: ProfileSnapshot,
    ) -> Result<Option<Recomputed<ProgressResult>>, EngineError> {
        let relevant = {
            let mut current = self.profile.write().unwrap_or_else(|e| e.into_inner());
            let relevant = current.as_ref().map_or(true, |previous| {
                previous.user_id != profile.user_id
                    || previous
                        .changed_fields(&profile)
                        .iter()
                        .any(|f| f.affects_progress())
            });
            *current = Some(profile);
            relevant
        };
        if !relevant {
            return Ok(None);
        }
        self.recompute().await.map(Some)
    }

    /// Recompute from the current profile.
    ///
    /// Profiles without the minimum data publish a zeroed result without
    /// touching storage.
    ///
    /// # Errors
    /// `InsufficientData` if no profile was ever installed, `StoreUnavailable`
    /// if the completion query fails (the previous result stays published).
    pub async fn recompute(&self) -> Result<Recomputed<ProgressResult>, EngineError> {
        let profile = self.profile().ok_or_else(|| EngineError::InsufficientData {
            user_id: String::new(),
            operation: "progress.recompute",
        })?;

        let Some(goal) = GoalSpec::from_profile(&profile, &self.policy) else {
            debug!(user_id = %profile.user_id, "profile has no usable goal, publishing zeroed progress");
            let zeroed = ProgressResult::zeroed(profile.target_days);
            return self
                .coordinator
                .request_recompute(|| async move { Ok::<_, EngineError>(zeroed) })
                .await;
        };

        let store = Arc::clone(&self.store);
        let today = self.clock.today();

        self.coordinator
            .request_recompute(|| query_progress(store, profile.user_id, goal, today))
            .await
    }

    /// Last published result.
    pub fn latest(&self) -> Option<ProgressResult> {
        self.coordinator.latest()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Published<ProgressResult>>> {
        self.coordinator.subscribe()
    }

    pub fn profile(&self) -> Option<ProfileSnapshot> {
        self.profile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_profile(&self, profile: ProfileSnapshot) {
        *self.profile.write().unwrap_or_else(|e| e.into_inner()) = Some(profile);
    }

    /// Recompute on every bus event that invalidates this profile's progress.
    ///
    /// `ProfileChanged` re-reads the profile from the configured source
    /// first. Each trigger runs as its own task; overlapping triggers are
    /// settled by the coordinator. A lagged receiver reloads and recomputes
    /// once since the skipped events can't be inspected.
    pub fn spawn_listener(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(user_id) = engine.profile().map(|p| p.user_id) else {
                            continue;
                        };
                        if event.invalidates_progress(&user_id) {
                            let reload = matches!(event, Event::ProfileChanged { .. });
                            engine.trigger(reload);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "progress listener lagged");
                        engine.trigger(true);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("event bus closed, stopping progress listener");
                        break;
                    }
                }
            }
        })
    }

    fn trigger(self: &Arc<Self>, reload: bool) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let fresh = if reload { engine.reload_profile().await } else { None };
            let outcome = match fresh {
                Some(fresh) => engine.replace_and_recompute(fresh).await,
                None => engine.recompute().await.map(|_| ()),
            };
            if let Err(e) = outcome {
                if !e.is_advisory() {
                    warn!(error = %e, "triggered progress recompute failed");
                }
            }
        });
    }

    /// Install `fresh` and recompute even if no relevant field differs, since
    /// completions may have moved too.
    async fn replace_and_recompute(&self, fresh: ProfileSnapshot) -> Result<(), EngineError> {
        if self.update_profile(fresh).await?.is_none() {
            self.recompute().await?;
        }
        Ok(())
    }

    /// Current profile as the source has it; `None` without a source or on
    /// failure, in which case the cached snapshot stays in use.
    async fn reload_profile(&self) -> Option<ProfileSnapshot> {
        let source = self.profile_source.as_ref()?;
        let user_id = self.profile()?.user_id;
        match source.load_profile(&user_id).await {
            Ok(Some(fresh)) => Some(fresh),
            Ok(None) => {
                debug!(user_id = %user_id, "profile source has no profile for user");
                None
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "profile reload failed, keeping cached snapshot");
                None
            }
        }
    }
}

async fn query_progress(
    store: Arc<dyn CompletionStore>,
    user_id: String,
    goal: GoalSpec,
    today: DayKey,
) -> Result<ProgressResult, EngineError> {
    let records = match store.query(&user_id, goal.window()).await {
        Ok(records) => records,
        Err(e) => {
            warn!(user_id = %user_id, day_key = %today, error = %e, "completion query failed");
            return Err(EngineError::StoreUnavailable {
                user_id,
                day_key: today,
                operation: "progress.query",
                message: e.to_string(),
            });
        }
    };
    Ok(compute_progress(&goal, today, &records))
}
