//! Integration tests for the progress and challenge engines.
//!
//! These run the engines against real store backends and simulated latency
//! to check publish ordering, single-flight generation, and idempotent
//! completion and linking.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Barrier, Semaphore};

use dayring_core::{
    ChallengeDraft, ChallengeEngine, ChallengeKind, ChallengeSignal, ChallengeStore,
    CompletionRecord, CompletionStore, ContentGenerator, Database, DatabaseError, DayKey,
    DayRange, EngineError, GeneratorError, ManualClock, MemoryStore, ProfileSnapshot,
    ProgressEngine, Recomputed, TemplateGenerator,
};

fn day(s: &str) -> DayKey {
    s.parse().unwrap()
}

fn profile() -> ProfileSnapshot {
    ProfileSnapshot {
        goal: "Thirty days of movement".into(),
        start_date: Some(day("2024-01-01")),
        target_days: 30,
        buffer_days: Some(3),
        ..ProfileSnapshot::new("u1")
    }
}

async fn seed<S: CompletionStore>(store: &S, days: std::ops::Range<i64>) {
    let start = day("2024-01-01");
    for i in days {
        store
            .record(CompletionRecord::new("u1", start.add_days(i).unwrap(), true))
            .await
            .unwrap();
    }
}

/// Completion store that snapshots its data, then parks one chosen query
/// until released.
struct GatedStore {
    inner: MemoryStore,
    queries: AtomicUsize,
    gated_query: usize,
    gate: Semaphore,
    offline: AtomicBool,
}

impl GatedStore {
    fn gating(gated_query: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            queries: AtomicUsize::new(0),
            gated_query,
            gate: Semaphore::new(0),
            offline: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CompletionStore for GatedStore {
    async fn query(
        &self,
        user_id: &str,
        range: DayRange,
    ) -> Result<Vec<CompletionRecord>, DatabaseError> {
        let n = self.queries.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable("network down".into()));
        }
        let snapshot = self.inner.query(user_id, range).await?;
        if n == self.gated_query {
            self.gate.acquire().await.unwrap().forget();
        }
        Ok(snapshot)
    }

    async fn record(&self, record: CompletionRecord) -> Result<(), DatabaseError> {
        self.inner.record(record).await
    }
}

/// Generator with artificial latency that counts its calls.
#[derive(Default)]
struct SlowGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl ContentGenerator for SlowGenerator {
    async fn generate_challenge(
        &self,
        _profile: &ProfileSnapshot,
        _day_key: DayKey,
    ) -> Result<ChallengeDraft, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(ChallengeDraft {
            title: "Take the stairs".into(),
            subtitle: "Every time".into(),
            emoji: "🪜".into(),
            kind: ChallengeKind::Workout,
            target_value: 10,
        })
    }
}

#[tokio::test]
async fn test_buffer_tolerance_against_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open_at(dir.path().join("dayring.db")).unwrap());
    seed(db.as_ref(), 0..27).await;

    let clock = Arc::new(ManualClock::at_day(day("2024-01-30")));
    let engine = ProgressEngine::new(db.clone(), clock);
    let full = engine.activate(profile()).await.unwrap().into_result().unwrap();
    assert_eq!(full.completed_days, 27);
    assert_eq!(full.fraction, 1.0);

    // un-completing a day overwrites its row
    db.record(CompletionRecord::new("u1", day("2024-01-05"), false))
        .await
        .unwrap();
    let short = engine.recompute().await.unwrap().into_result().unwrap();
    assert_eq!(short.completed_days, 26);
    assert!((short.fraction - 26.0 / 27.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_slow_stale_recompute_is_discarded() {
    let store = Arc::new(GatedStore::gating(1));
    seed(store.as_ref(), 0..3).await;
    let clock = Arc::new(ManualClock::at_day(day("2024-01-30")));
    let engine = Arc::new(ProgressEngine::new(store.clone(), clock));
    engine.activate(profile()).await.unwrap();

    // R1 reads three completions, then stalls
    let r1 = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.recompute().await })
    };
    while store.queries.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }

    // R2 starts later, sees eight, and finishes first
    seed(store.as_ref(), 3..8).await;
    let r2 = engine.recompute().await.unwrap();
    assert!(r2.is_published());
    assert_eq!(engine.latest().unwrap().completed_days, 8);

    store.gate.add_permits(1);
    let r1 = r1.await.unwrap().unwrap();
    assert!(matches!(r1, Recomputed::Discarded { .. }));
    assert!(matches!(
        r1.into_result(),
        Err(EngineError::RaceDiscarded { .. })
    ));
    assert_eq!(engine.latest().unwrap().completed_days, 8);
}

#[tokio::test]
async fn test_store_outage_keeps_last_published_progress() {
    let store = Arc::new(GatedStore::gating(usize::MAX));
    seed(store.as_ref(), 0..12).await;
    let clock = Arc::new(ManualClock::at_day(day("2024-01-30")));
    let engine = ProgressEngine::new(store.clone(), clock);
    let before = engine.activate(profile()).await.unwrap().into_result().unwrap();

    store.offline.store(true, Ordering::SeqCst);
    let err = engine.recompute().await.unwrap_err();
    assert!(matches!(err, EngineError::StoreUnavailable { .. }));
    assert!(!err.is_advisory());
    assert_eq!(engine.latest(), Some(before));
    assert_eq!(before.completed_days, 12);
}

#[tokio::test]
async fn test_new_day_triggers_exactly_one_generation() {
    let generator = Arc::new(TemplateGenerator::new());
    let clock = Arc::new(ManualClock::at_day(day("2024-01-10")));
    let engine = ChallengeEngine::new(
        generator.clone(),
        Arc::new(MemoryStore::new()),
        clock.clone(),
    );

    let first_day = engine.load_or_generate_today(&profile()).await.unwrap();
    engine.load_or_generate_today(&profile()).await.unwrap();
    assert_eq!(generator.calls(), 1);

    clock.advance(chrono::Duration::days(1));
    let next_day = engine.load_or_generate_today(&profile()).await.unwrap();
    assert_eq!(next_day.day_key, day("2024-01-11"));
    assert_ne!(next_day.id, first_day.id);
    engine.load_or_generate_today(&profile()).await.unwrap();
    assert_eq!(generator.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_share_one_generation() {
    const CALLERS: usize = 16;
    let generator = Arc::new(SlowGenerator::default());
    let engine = ChallengeEngine::new(
        generator.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::at_day(day("2024-01-10"))),
    );
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                engine.load_or_generate_today(&profile()).await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_tap_link_creates_one_task() {
    const CALLERS: usize = 8;
    let db = Arc::new(Database::open_memory().unwrap());
    let engine = ChallengeEngine::new(
        Arc::new(TemplateGenerator::new()),
        db.clone(),
        Arc::new(ManualClock::at_day(day("2024-01-10"))),
    );
    let artifact = engine.load_or_generate_today(&profile()).await.unwrap();
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = engine.clone();
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                engine
                    .link_to_task("u1", move |artifact| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        db.create_task("u1", &artifact.title, Some(&artifact.id))
                    })
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let again = engine
        .link_to_task("u1", |_| async { Err::<String, _>("factory must not run") })
        .await
        .unwrap();
    assert_eq!(again, ids[0]);

    let tasks = db.list_tasks("u1").unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].source_challenge_id.as_deref(), Some(artifact.id.as_str()));

    // the link survives a restart
    let reloaded = db.load("u1", artifact.day_key).await.unwrap().unwrap();
    assert_eq!(reloaded.linked_task_id.as_deref(), Some(ids[0].as_str()));
}

#[tokio::test]
async fn test_completion_signal_fires_once() {
    let engine = ChallengeEngine::new(
        Arc::new(TemplateGenerator::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::at_day(day("2024-01-10"))),
    );
    engine.load_or_generate_today(&profile()).await.unwrap();
    let mut signals = engine.subscribe_signals();

    let first = engine.mark_completed("u1").await.unwrap();
    let second = engine.mark_completed("u1").await.unwrap();
    assert!(first.completed && second.completed);
    assert_eq!(first, second);

    let mut completed = 0;
    while let Ok(signal) = signals.try_recv() {
        if matches!(signal, ChallengeSignal::Completed { .. }) {
            completed += 1;
        }
    }
    assert_eq!(completed, 1);
}

