//! Challenge engine: once-per-day generation, completion and task linking.
//!
//! Each `(user_id, day_key)` owns a slot holding a small state machine:
//! `Absent -> Generating -> Ready`. Completion and linking are flags on the
//! ready artifact, each written through a claim that concurrent callers join
//! and flipped in memory only once persisted. Slot transitions happen under a per-slot mutex that is
//! never held across an await, so unrelated users and days never contend.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::artifact::ChallengeArtifact;
use super::flight::{self, Flight, FlightLeader, Outcome};
use super::generator::ContentGenerator;
use crate::clock::{Clock, DayKey};
use crate::error::{DatabaseError, EngineError};
use crate::profile::ProfileSnapshot;
use crate::storage::ChallengeStore;

const SIGNAL_CAPACITY: usize = 64;

/// One-shot notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChallengeSignal {
    Generated {
        user_id: String,
        day_key: DayKey,
        challenge_id: String,
        refreshed: bool,
    },
    /// Emitted at most once per artifact.
    Completed {
        user_id: String,
        day_key: DayKey,
        challenge_id: String,
    },
    Linked {
        user_id: String,
        day_key: DayKey,
        challenge_id: String,
        task_id: String,
    },
}

enum Phase {
    Absent,
    Generating(Flight<ChallengeArtifact>),
    Ready(ChallengeArtifact),
}

/// An in-flight write against one artifact that later callers join.
struct Claim<T> {
    artifact_id: String,
    flight: Flight<T>,
}

#[derive(Default)]
struct Claims {
    linking: Option<Claim<String>>,
    completing: Option<Claim<ChallengeArtifact>>,
}

fn linking(claims: &mut Claims) -> &mut Option<Claim<String>> {
    &mut claims.linking
}

fn completing(claims: &mut Claims) -> &mut Option<Claim<ChallengeArtifact>> {
    &mut claims.completing
}

struct SlotState {
    phase: Phase,
    claims: Claims,
}

type Slot = Mutex<SlotState>;
type SlotKey = (String, DayKey);

fn lock(slot: &Slot) -> MutexGuard<'_, SlotState> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    generator: Arc<dyn ContentGenerator>,
    store: Arc<dyn ChallengeStore>,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<SlotKey, Arc<Slot>>>,
    signals: broadcast::Sender<ChallengeSignal>,
}

/// Owns today's challenge for every user it is asked about.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct ChallengeEngine {
    inner: Arc<Inner>,
}

enum Step<T> {
    Done(T),
    Join(Flight<T>),
    Lead(FlightLeader<T>, ChallengeArtifact),
}

/// Join the claim already held on `artifact`, or take it.
fn join_or_lead<T: Clone>(claim: &mut Option<Claim<T>>, artifact: &ChallengeArtifact) -> Step<T> {
    if let Some(held) = claim.as_ref().filter(|c| c.artifact_id == artifact.id) {
        return Step::Join(held.flight.clone());
    }
    let (leader, flight) = flight::start();
    *claim = Some(Claim {
        artifact_id: artifact.id.clone(),
        flight,
    });
    Step::Lead(leader, artifact.clone())
}

impl ChallengeEngine {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        store: Arc<dyn ChallengeStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                generator,
                store,
                clock,
                slots: Mutex::new(HashMap::new()),
                signals,
            }),
        }
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ChallengeSignal> {
        self.inner.signals.subscribe()
    }

    /// Today's ready artifact for `user_id`, if one is cached. Never waits.
    pub fn current(&self, user_id: &str) -> Option<ChallengeArtifact> {
        let today = self.inner.clock.today();
        let slot = {
            let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(&(user_id.to_string(), today)).cloned()
        }?;
        let state = lock(&slot);
        match &state.phase {
            Phase::Ready(artifact) if artifact.is_current(today) => Some(artifact.clone()),
            _ => None,
        }
    }

    /// Return today's artifact, generating it if none exists yet.
    ///
    /// Concurrent callers for the same user and day share one generation.
    /// The generation runs as its own task, so dropping the returned future
    /// does not abandon it.
    ///
    /// # Errors
    /// `InsufficientData` if the profile lacks goal data, `GenerationFailed`
    /// if the generator call fails, `StoreUnavailable` if the artifact can't
    /// be loaded or saved. After any failure the day is back to absent.
    pub async fn load_or_generate_today(
        &self,
        profile: &ProfileSnapshot,
    ) -> Result<ChallengeArtifact, EngineError> {
        require_minimum_data(profile, "challenge.load_or_generate")?;
        let today = self.inner.clock.today();
        let slot = self.inner.slot(&profile.user_id, today);

        let (flight, leader) = {
            let mut state = lock(&slot);
            match &state.phase {
                Phase::Ready(artifact) => return Ok(artifact.clone()),
                Phase::Generating(flight) => (flight.clone(), None),
                Phase::Absent => {
                    let (leader, flight) = flight::start();
                    state.phase = Phase::Generating(flight.clone());
                    (flight, Some(leader))
                }
            }
        };

        if let Some(leader) = leader {
            self.spawn_generation(slot, profile.clone(), today, leader, false);
        } else {
            debug!(user_id = %profile.user_id, day_key = %today, "joining in-flight challenge generation");
        }
        let user_id = profile.user_id.clone();
        flight
            .wait(|| generation_abandoned(&user_id, today))
            .await
    }

    /// Replace today's artifact with a freshly generated one.
    ///
    /// # Errors
    /// `GenerationInProgress` if a generation is already running for today;
    /// otherwise as [`ChallengeEngine::load_or_generate_today`]. On failure
    /// the previous artifact stays in the store and is picked up again on
    /// the next access.
    pub async fn refresh(
        &self,
        profile: &ProfileSnapshot,
    ) -> Result<ChallengeArtifact, EngineError> {
        require_minimum_data(profile, "challenge.refresh")?;
        let today = self.inner.clock.today();
        let slot = self.inner.slot(&profile.user_id, today);

        let (leader, flight) = {
            let mut state = lock(&slot);
            if matches!(state.phase, Phase::Generating(_)) {
                return Err(EngineError::GenerationInProgress {
                    user_id: profile.user_id.clone(),
                    day_key: today,
                });
            }
            let (leader, flight) = flight::start();
            state.phase = Phase::Generating(flight.clone());
            (leader, flight)
        };

        self.spawn_generation(slot, profile.clone(), today, leader, true);
        let user_id = profile.user_id.clone();
        flight
            .wait(|| generation_abandoned(&user_id, today))
            .await
    }

    /// Mark today's artifact completed. Repeat calls are no-ops and the
    /// completion signal fires only on the first.
    ///
    /// Concurrent callers share one save and its outcome; nobody sees the
    /// artifact completed before that save succeeds.
    ///
    /// # Errors
    /// `NoActiveChallenge` if nothing exists for today, `StoreUnavailable`
    /// if the change can't be persisted (the artifact stays incomplete).
    pub async fn mark_completed(&self, user_id: &str) -> Result<ChallengeArtifact, EngineError> {
        let today = self.inner.clock.today();
        let slot = self.inner.slot(user_id, today);

        let step = self
            .with_ready(user_id, today, &slot, "challenge.complete", |artifact, claims| {
                if artifact.completed && artifact.toast_shown {
                    return Step::Done(artifact.clone());
                }
                join_or_lead(&mut claims.completing, artifact)
            })
            .await?;

        match step {
            Step::Done(artifact) => Ok(artifact),
            Step::Join(flight) => {
                debug!(user_id, day_key = %today, "joining in-flight completion");
                flight
                    .wait(|| EngineError::StoreUnavailable {
                        user_id: user_id.to_string(),
                        day_key: today,
                        operation: "challenge.complete",
                        message: "completing caller went away".into(),
                    })
                    .await
            }
            Step::Lead(leader, artifact) => {
                let guard = ReleaseClaim {
                    slot: &slot,
                    artifact_id: artifact.id.clone(),
                    pick: completing,
                };
                let outcome = self.finish_completion(&slot, artifact).await;
                drop(guard);
                leader.land(outcome.clone());
                outcome
            }
        }
    }

    async fn finish_completion(
        &self,
        slot: &Slot,
        artifact: ChallengeArtifact,
    ) -> Outcome<ChallengeArtifact> {
        let announce = !artifact.toast_shown;
        let mut updated = artifact;
        updated.completed = true;
        updated.toast_shown = true;

        let user_id = updated.user_id.clone();
        let day_key = updated.day_key;
        if let Err(e) = self.inner.store.save(&updated).await {
            warn!(user_id = %user_id, day_key = %day_key, error = %e, "failed to persist completion");
            return Err(store_unavailable(&user_id, day_key, "challenge.complete", &e));
        }

        let completed = {
            let mut state = lock(slot);
            match &mut state.phase {
                Phase::Ready(current) if current.id == updated.id => {
                    current.completed = true;
                    current.toast_shown = true;
                    current.clone()
                }
                _ => updated,
            }
        };

        info!(user_id = %user_id, day_key = %day_key, challenge_id = %completed.id, "challenge completed");
        if announce {
            self.inner.emit(ChallengeSignal::Completed {
                user_id,
                day_key,
                challenge_id: completed.id.clone(),
            });
        }
        Ok(completed)
    }

    /// Link today's artifact to a downstream task, creating it via `factory`
    /// at most once.
    ///
    /// An already-linked artifact returns its task id without calling
    /// `factory`; concurrent callers wait for the one in flight.
    ///
    /// # Errors
    /// `NoActiveChallenge` if nothing exists for today, `TaskLinkFailed` if
    /// `factory` fails.
    pub async fn link_to_task<F, Fut, E>(
        &self,
        user_id: &str,
        factory: F,
    ) -> Result<String, EngineError>
    where
        F: FnOnce(ChallengeArtifact) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Display,
    {
        let today = self.inner.clock.today();
        let slot = self.inner.slot(user_id, today);

        let step = self
            .with_ready(user_id, today, &slot, "challenge.link", |artifact, claims| {
                if let Some(task_id) = &artifact.linked_task_id {
                    return Step::Done(task_id.clone());
                }
                join_or_lead(&mut claims.linking, artifact)
            })
            .await?;

        match step {
            Step::Done(task_id) => Ok(task_id),
            Step::Join(flight) => {
                debug!(user_id, day_key = %today, "joining in-flight task link");
                flight
                    .wait(|| EngineError::TaskLinkFailed {
                        user_id: user_id.to_string(),
                        day_key: today,
                        message: "linking caller went away".into(),
                    })
                    .await
            }
            Step::Lead(leader, artifact) => {
                let guard = ReleaseClaim {
                    slot: &slot,
                    artifact_id: artifact.id.clone(),
                    pick: linking,
                };
                let outcome = self.finish_link(&slot, artifact, factory).await;
                drop(guard);
                leader.land(outcome.clone());
                outcome
            }
        }
    }

    async fn finish_link<F, Fut, E>(
        &self,
        slot: &Slot,
        artifact: ChallengeArtifact,
        factory: F,
    ) -> Outcome<String>
    where
        F: FnOnce(ChallengeArtifact) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Display,
    {
        let user_id = artifact.user_id.clone();
        let day_key = artifact.day_key;
        let challenge_id = artifact.id.clone();

        let task_id = match factory(artifact).await {
            Ok(task_id) => task_id,
            Err(e) => {
                warn!(user_id = %user_id, day_key = %day_key, error = %e, "task factory failed");
                return Err(EngineError::TaskLinkFailed {
                    user_id,
                    day_key,
                    message: e.to_string(),
                });
            }
        };

        let linked = {
            let mut state = lock(slot);
            match &mut state.phase {
                Phase::Ready(current) if current.id == challenge_id => {
                    current.linked_task_id = Some(task_id.clone());
                    Some(current.clone())
                }
                _ => None,
            }
        };

        let Some(linked) = linked else {
            warn!(user_id = %user_id, day_key = %day_key, task_id = %task_id, "challenge replaced while linking, link not recorded");
            return Ok(task_id);
        };

        if let Err(e) = self.inner.store.save(&linked).await {
            // the link stays in memory and goes out with the next save
            warn!(user_id = %user_id, day_key = %day_key, error = %e, "failed to persist task link");
        }

        info!(user_id = %user_id, day_key = %day_key, task_id = %task_id, "challenge linked to task");
        self.inner.emit(ChallengeSignal::Linked {
            user_id,
            day_key,
            challenge_id,
            task_id: task_id.clone(),
        });
        Ok(task_id)
    }

    /// Run `apply` against the ready artifact for `(user_id, today)`, first
    /// waiting out a generation or loading the artifact from the store.
    async fn with_ready<R>(
        &self,
        user_id: &str,
        today: DayKey,
        slot: &Slot,
        operation: &'static str,
        mut apply: impl FnMut(&mut ChallengeArtifact, &mut Claims) -> R,
    ) -> Result<R, EngineError> {
        for _ in 0..3 {
            let pending = {
                let mut guard = lock(slot);
                let state = &mut *guard;
                match &mut state.phase {
                    Phase::Ready(artifact) => return Ok(apply(artifact, &mut state.claims)),
                    Phase::Generating(flight) => Some(flight.clone()),
                    Phase::Absent => None,
                }
            };

            match pending {
                Some(flight) => {
                    flight
                        .wait(|| generation_abandoned(user_id, today))
                        .await?;
                }
                None => {
                    let stored = self
                        .inner
                        .store
                        .load(user_id, today)
                        .await
                        .map_err(|e| store_unavailable(user_id, today, operation, &e))?;
                    let Some(artifact) = stored.filter(|a| a.is_current(today)) else {
                        return Err(EngineError::NoActiveChallenge {
                            user_id: user_id.to_string(),
                            day_key: today,
                        });
                    };
                    let mut state = lock(slot);
                    if matches!(state.phase, Phase::Absent) {
                        state.phase = Phase::Ready(artifact);
                    }
                }
            }
        }

        Err(EngineError::GenerationInProgress {
            user_id: user_id.to_string(),
            day_key: today,
        })
    }

    fn spawn_generation(
        &self,
        slot: Arc<Slot>,
        profile: ProfileSnapshot,
        today: DayKey,
        leader: FlightLeader<ChallengeArtifact>,
        refresh: bool,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut reset = ResetOnDrop {
                slot: &slot,
                armed: true,
            };
            let outcome = inner.produce(&profile, today, refresh).await;

            {
                let mut state = lock(&slot);
                match &outcome {
                    Ok((artifact, _)) => {
                        if refresh {
                            state.claims = Claims::default();
                        }
                        state.phase = Phase::Ready(artifact.clone());
                    }
                    Err(_) => state.phase = Phase::Absent,
                }
            }
            reset.armed = false;

            if let Ok((artifact, true)) = &outcome {
                inner.emit(ChallengeSignal::Generated {
                    user_id: artifact.user_id.clone(),
                    day_key: artifact.day_key,
                    challenge_id: artifact.id.clone(),
                    refreshed: refresh,
                });
            }
            leader.land(outcome.map(|(artifact, _)| artifact));
        });
    }
}

impl Inner {
    /// Slot for `(user_id, today)`; slots for the user's earlier days are dropped.
    fn slot(&self, user_id: &str, today: DayKey) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|(user, day), _| user != user_id || *day == today);
        Arc::clone(
            slots
                .entry((user_id.to_string(), today))
                .or_insert_with(|| {
                    Arc::new(Mutex::new(SlotState {
                        phase: Phase::Absent,
                        claims: Claims::default(),
                    }))
                }),
        )
    }

    fn emit(&self, signal: ChallengeSignal) {
        let _ = self.signals.send(signal);
    }

    /// Stored artifact (unless refreshing) or a freshly generated and saved
    /// one. The flag is true when the generator was called.
    async fn produce(
        &self,
        profile: &ProfileSnapshot,
        today: DayKey,
        refresh: bool,
    ) -> Outcome<(ChallengeArtifact, bool)> {
        let user_id = profile.user_id.as_str();

        if !refresh {
            match self.store.load(user_id, today).await {
                Ok(Some(artifact)) => {
                    debug!(user_id, day_key = %today, "reusing stored challenge");
                    return Ok((artifact, false));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id, day_key = %today, error = %e, "challenge load failed");
                    return Err(store_unavailable(user_id, today, "challenge.load", &e));
                }
            }
        }

        let draft = match self.generator.generate_challenge(profile, today).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!(user_id, day_key = %today, error = %e, "challenge generation failed");
                return Err(EngineError::GenerationFailed {
                    user_id: user_id.to_string(),
                    day_key: today,
                    message: e.to_string(),
                });
            }
        };

        let artifact = ChallengeArtifact::from_draft(user_id, today, draft);
        if let Err(e) = self.store.save(&artifact).await {
            warn!(user_id, day_key = %today, error = %e, "challenge save failed");
            return Err(store_unavailable(user_id, today, "challenge.save", &e));
        }

        info!(user_id, day_key = %today, challenge_id = %artifact.id, refresh, "challenge generated");
        Ok((artifact, true))
    }
}

/// Puts a slot back to absent if its generation task dies without finishing.
struct ResetOnDrop<'a> {
    slot: &'a Slot,
    armed: bool,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = lock(self.slot);
            if matches!(state.phase, Phase::Generating(_)) {
                state.phase = Phase::Absent;
            }
        }
    }
}

/// Releases the claim `pick` selects, if it still belongs to `artifact_id`.
struct ReleaseClaim<'a, T> {
    slot: &'a Slot,
    artifact_id: String,
    pick: fn(&mut Claims) -> &mut Option<Claim<T>>,
}

impl<T> Drop for ReleaseClaim<'_, T> {
    fn drop(&mut self) {
        let mut state = lock(self.slot);
        let claim = (self.pick)(&mut state.claims);
        if claim
            .as_ref()
            .is_some_and(|c| c.artifact_id == self.artifact_id)
        {
            *claim = None;
        }
    }
}

fn require_minimum_data(
    profile: &ProfileSnapshot,
    operation: &'static str,
) -> Result<(), EngineError> {
    if profile.has_minimum_data() {
        Ok(())
    } else {
        Err(EngineError::InsufficientData {
            user_id: profile.user_id.clone(),
            operation,
        })
    }
}

fn store_unavailable(
    user_id: &str,
    day_key: DayKey,
    operation: &'static str,
    err: &DatabaseError,
) -> EngineError {
    EngineError::StoreUnavailable {
        user_id: user_id.to_string(),
        day_key,
        operation,
        message: err.to_string(),
    }
}

fn generation_abandoned(user_id: &str, day_key: DayKey) -> EngineError {
    EngineError::GenerationFailed {
        user_id: user_id.to_string(),
        day_key,
        message: "generation task ended without a result".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{ChallengeDraft, ChallengeKind};
    use crate::clock::ManualClock;
    use crate::error::GeneratorError;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn profile() -> ProfileSnapshot {
        ProfileSnapshot {
            goal: "Move daily".into(),
            start_date: Some(day("2024-01-01")),
            target_days: 30,
            ..ProfileSnapshot::new("u1")
        }
    }

    /// Counts calls, can fail on demand, and can be held at a gate.
    struct ScriptedGenerator {
        calls: AtomicUsize,
        failing: AtomicBool,
        gate: Option<Semaphore>,
    }

    impl ScriptedGenerator {
        fn open() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                gate: None,
            }
        }

        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::open()
            }
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1);
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentGenerator for ScriptedGenerator {
        async fn generate_challenge(
            &self,
            _profile: &ProfileSnapshot,
            _day_key: DayKey,
        ) -> Result<ChallengeDraft, GeneratorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(GeneratorError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(ChallengeDraft {
                title: format!("Challenge {n}"),
                subtitle: String::new(),
                emoji: "⭐".into(),
                kind: ChallengeKind::Steps,
                target_value: 5000,
            })
        }
    }

    /// MemoryStore whose saves can be switched off or held at a gate.
    struct FlakyStore {
        inner: MemoryStore,
        saves_fail: AtomicBool,
        hold_saves: AtomicBool,
        save_gate: Semaphore,
        saves: AtomicUsize,
    }

    impl Default for FlakyStore {
        fn default() -> Self {
            Self {
                inner: MemoryStore::new(),
                saves_fail: AtomicBool::new(false),
                hold_saves: AtomicBool::new(false),
                save_gate: Semaphore::new(0),
                saves: AtomicUsize::new(0),
            }
        }
    }

    impl FlakyStore {
        fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChallengeStore for FlakyStore {
        async fn load(
            &self,
            user_id: &str,
            day_key: DayKey,
        ) -> Result<Option<ChallengeArtifact>, DatabaseError> {
            self.inner.load(user_id, day_key).await
        }

        async fn save(&self, artifact: &ChallengeArtifact) -> Result<(), DatabaseError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.hold_saves.load(Ordering::SeqCst) {
                self.save_gate.acquire().await.unwrap().forget();
            }
            if self.saves_fail.load(Ordering::SeqCst) {
                return Err(DatabaseError::Unavailable("offline".into()));
            }
            self.inner.save(artifact).await
        }
    }

    fn build(generator: Arc<ScriptedGenerator>, store: Arc<FlakyStore>) -> ChallengeEngine {
        let clock = Arc::new(ManualClock::at_day(day("2024-01-10")));
        ChallengeEngine::new(generator, store, clock)
    }

    #[tokio::test]
    async fn stored_artifact_is_reused_without_generation() {
        let generator = Arc::new(ScriptedGenerator::open());
        let store = Arc::new(FlakyStore::default());
        let existing = ChallengeArtifact::from_draft(
            "u1",
            day("2024-01-10"),
            ChallengeDraft {
                title: "Saved".into(),
                subtitle: String::new(),
                emoji: String::new(),
                kind: ChallengeKind::Sleep,
                target_value: 8,
            },
        );
        store.save(&existing).await.unwrap();

        let engine = build(Arc::clone(&generator), store);
        let mut signals = engine.subscribe_signals();
        let artifact = engine.load_or_generate_today(&profile()).await.unwrap();
        assert_eq!(artifact, existing);
        assert_eq!(generator.calls(), 0);
        assert!(signals.try_recv().is_err());
        assert_eq!(engine.current("u1"), Some(existing));
    }

    #[tokio::test]
    async fn insufficient_profile_short_circuits() {
        let generator = Arc::new(ScriptedGenerator::open());
        let engine = build(Arc::clone(&generator), Arc::new(FlakyStore::default()));
        let err = engine
            .load_or_generate_today(&ProfileSnapshot::new("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn failed_generation_reverts_to_absent_and_retries() {
        let generator = Arc::new(ScriptedGenerator::open());
        let store = Arc::new(FlakyStore::default());
        let engine = build(Arc::clone(&generator), Arc::clone(&store));

        generator.failing.store(true, Ordering::SeqCst);
        let err = engine.load_or_generate_today(&profile()).await.unwrap_err();
        assert!(matches!(err, EngineError::GenerationFailed { .. }));
        assert!(engine.current("u1").is_none());
        assert!(store.load("u1", day("2024-01-10")).await.unwrap().is_none());

        generator.failing.store(false, Ordering::SeqCst);
        let artifact = engine.load_or_generate_today(&profile()).await.unwrap();
        assert_eq!(generator.calls(), 2);
        assert_eq!(store.load("u1", day("2024-01-10")).await.unwrap(), Some(artifact));
    }

    #[tokio::test]
    async fn failed_save_is_store_unavailable() {
        let generator = Arc::new(ScriptedGenerator::open());
        let store = Arc::new(FlakyStore::default());
        store.saves_fail.store(true, Ordering::SeqCst);
        let engine = build(generator, store);

        match engine.load_or_generate_today(&profile()).await {
            Err(EngineError::StoreUnavailable { operation, .. }) => {
                assert_eq!(operation, "challenge.save")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(engine.current("u1").is_none());
    }

    #[tokio::test]
    async fn refresh_is_rejected_while_generating() {
        let generator = Arc::new(ScriptedGenerator::gated());
        let engine = build(Arc::clone(&generator), Arc::new(FlakyStore::default()));

        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.load_or_generate_today(&profile()).await })
        };
        while generator.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let err = engine.refresh(&profile()).await.unwrap_err();
        assert!(matches!(err, EngineError::GenerationInProgress { .. }));

        generator.release();
        pending.await.unwrap().unwrap();
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_artifact_and_clears_link() {
        let generator = Arc::new(ScriptedGenerator::open());
        let store = Arc::new(FlakyStore::default());
        let engine = build(Arc::clone(&generator), Arc::clone(&store));
        let mut signals = engine.subscribe_signals();

        let first = engine.load_or_generate_today(&profile()).await.unwrap();
        engine
            .link_to_task("u1", |_| async { Ok::<_, String>("task-1".to_string()) })
            .await
            .unwrap();

        let second = engine.refresh(&profile()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.linked_task_id.is_none());
        assert_eq!(store.load("u1", day("2024-01-10")).await.unwrap(), Some(second.clone()));

        let task = engine
            .link_to_task("u1", |a| async move { Ok::<_, String>(format!("task-for-{}", a.id)) })
            .await
            .unwrap();
        assert_eq!(task, format!("task-for-{}", second.id));

        let mut refreshed = 0;
        while let Ok(signal) = signals.try_recv() {
            if let ChallengeSignal::Generated { refreshed: true, .. } = signal {
                refreshed += 1;
            }
        }
        assert_eq!(refreshed, 1);
    }

    #[tokio::test]
    async fn completion_rolls_back_when_save_fails() {
        let generator = Arc::new(ScriptedGenerator::open());
        let store = Arc::new(FlakyStore::default());
        let engine = build(generator, Arc::clone(&store));
        let mut signals = engine.subscribe_signals();
        engine.load_or_generate_today(&profile()).await.unwrap();
        let _ = signals.try_recv();

        store.saves_fail.store(true, Ordering::SeqCst);
        let err = engine.mark_completed("u1").await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable { .. }));
        assert!(!engine.current("u1").unwrap().completed);
        assert!(signals.try_recv().is_err());

        store.saves_fail.store(false, Ordering::SeqCst);
        let done = engine.mark_completed("u1").await.unwrap();
        assert!(done.completed && done.toast_shown);
        assert!(matches!(signals.try_recv(), Ok(ChallengeSignal::Completed { .. })));
    }

    #[tokio::test]
    async fn concurrent_completion_shares_the_failed_save() {
        let store = Arc::new(FlakyStore::default());
        let engine = build(Arc::new(ScriptedGenerator::open()), Arc::clone(&store));
        engine.load_or_generate_today(&profile()).await.unwrap();
        let mut signals = engine.subscribe_signals();
        let saves_before = store.saves();

        store.hold_saves.store(true, Ordering::SeqCst);
        store.saves_fail.store(true, Ordering::SeqCst);
        let complete = |engine: ChallengeEngine| {
            tokio::spawn(async move { engine.mark_completed("u1").await })
        };

        let first = complete(engine.clone());
        while store.saves() == saves_before {
            tokio::task::yield_now().await;
        }
        let second = complete(engine.clone());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!engine.current("u1").unwrap().completed);

        store.save_gate.add_permits(1);
        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(matches!(first, Err(EngineError::StoreUnavailable { .. })));
        assert_eq!(second, first);
        assert_eq!(store.saves(), saves_before + 1);
        assert!(!engine.current("u1").unwrap().completed);
        assert!(signals.try_recv().is_err());

        store.hold_saves.store(false, Ordering::SeqCst);
        store.saves_fail.store(false, Ordering::SeqCst);
        let done = engine.mark_completed("u1").await.unwrap();
        assert!(done.completed);
        assert!(matches!(signals.try_recv(), Ok(ChallengeSignal::Completed { .. })));
        assert!(signals.try_recv().is_err());
    }

    /// Hands back yesterday's artifact whatever day is asked for.
    struct MisfiledStore;

    #[async_trait]
    impl ChallengeStore for MisfiledStore {
        async fn load(
            &self,
            user_id: &str,
            _day_key: DayKey,
        ) -> Result<Option<ChallengeArtifact>, DatabaseError> {
            Ok(Some(ChallengeArtifact::from_draft(
                user_id,
                day("2024-01-09"),
                ChallengeDraft {
                    title: "Yesterday".into(),
                    subtitle: String::new(),
                    emoji: String::new(),
                    kind: ChallengeKind::Steps,
                    target_value: 1000,
                },
            )))
        }

        async fn save(&self, _artifact: &ChallengeArtifact) -> Result<(), DatabaseError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stored_row_for_another_day_is_not_todays_challenge() {
        let clock = Arc::new(ManualClock::at_day(day("2024-01-10")));
        let engine = ChallengeEngine::new(
            Arc::new(ScriptedGenerator::open()),
            Arc::new(MisfiledStore),
            clock,
        );
        assert!(matches!(
            engine.mark_completed("u1").await,
            Err(EngineError::NoActiveChallenge { .. })
        ));
        assert!(engine.current("u1").is_none());
    }

    #[tokio::test]
    async fn complete_and_link_need_an_artifact() {
        let engine = build(
            Arc::new(ScriptedGenerator::open()),
            Arc::new(FlakyStore::default()),
        );
        assert!(matches!(
            engine.mark_completed("u1").await,
            Err(EngineError::NoActiveChallenge { .. })
        ));
        let called = AtomicBool::new(false);
        let result = engine
            .link_to_task("u1", |_| async {
                called.store(true, Ordering::SeqCst);
                Ok::<_, String>("t".to_string())
            })
            .await;
        assert!(matches!(result, Err(EngineError::NoActiveChallenge { .. })));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_factory_can_be_retried() {
        let engine = build(
            Arc::new(ScriptedGenerator::open()),
            Arc::new(FlakyStore::default()),
        );
        engine.load_or_generate_today(&profile()).await.unwrap();

        let err = engine
            .link_to_task("u1", |_| async { Err::<String, _>("tasks offline") })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskLinkFailed { .. }));
        assert!(engine.current("u1").unwrap().linked_task_id.is_none());

        let id = engine
            .link_to_task("u1", |_| async { Ok::<_, String>("task-9".to_string()) })
            .await
            .unwrap();
        assert_eq!(id, "task-9");
        assert_eq!(
            engine.current("u1").unwrap().linked_task_id.as_deref(),
            Some("task-9")
        );
    }

    #[tokio::test]
    async fn completion_is_picked_up_from_store_after_restart() {
        let generator = Arc::new(ScriptedGenerator::open());
        let store = Arc::new(FlakyStore::default());
        let first = build(Arc::clone(&generator), Arc::clone(&store));
        first.load_or_generate_today(&profile()).await.unwrap();
        first.mark_completed("u1").await.unwrap();

        let second = build(Arc::clone(&generator), store);
        let mut signals = second.subscribe_signals();
        let artifact = second.mark_completed("u1").await.unwrap();
        assert!(artifact.completed);
        assert!(signals.try_recv().is_err());
        assert_eq!(generator.calls(), 1);
    }
}
