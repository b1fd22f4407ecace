use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::tempdir;
use tokio::sync::broadcast::Receiver;

use counterparty_normalizer::{
    AppConfig, AppResult, Enricher, EnricherChain, EnrichmentResult, MemoryStore,
    NormalizationEngine, NormalizedRecord, NormalizedSink, RecordNormalizer, RecordSource,
    ResolvedFields, ResultCache, SessionEvent, SessionOptions, SessionStatus, SessionStore,
    SourceRecord, SqliteStore, StoreNormalizer, TaxId,
};

/// Slow normalizer that remembers every offset it finished.
struct Tracking<N> {
    inner: N,
    delay: Duration,
    finished: Mutex<Vec<(String, u64)>>,
}

impl<N> Tracking<N> {
    fn new(inner: N, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            finished: Mutex::new(Vec::new()),
        }
    }

    fn offsets(&self, database_ref: &str) -> Vec<u64> {
        let mut offsets: Vec<_> = self
            .finished
            .lock()
            .iter()
            .filter(|(db, _)| db == database_ref)
            .map(|(_, offset)| *offset)
            .collect();
        offsets.sort_unstable();
        offsets
    }
}

#[async_trait]
impl<N: RecordNormalizer> RecordNormalizer for Tracking<N> {
    async fn normalize(&self, database_ref: &str, record: &SourceRecord) -> AppResult<NormalizedRecord> {
        tokio::time::sleep(self.delay).await;
        self.inner.normalize(database_ref, record).await
    }

    async fn persist(&self, record: NormalizedRecord) -> AppResult<()> {
        let key = (record.database_ref.clone(), record.offset);
        self.inner.persist(record).await?;
        self.finished.lock().push(key);
        Ok(())
    }

    async fn analyze_duplicates(&self, database_ref: &str) -> AppResult<usize> {
        self.inner.analyze_duplicates(database_ref).await
    }
}

/// Answers every lookup with a confident match.
struct Registry;

#[async_trait]
impl Enricher for Registry {
    fn name(&self) -> &str {
        "registry"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn supports(&self, _id: &TaxId) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn enrich(&self, id: &TaxId) -> EnrichmentResult {
        EnrichmentResult::success(
            "registry",
            ResolvedFields {
                inn: Some(id.to_string()),
                short_name: Some(format!("ООО Реестр {id}")),
                ..ResolvedFields::default()
            },
            0.9,
        )
    }
}

fn config() -> AppConfig {
    AppConfig {
        worker_count: 4,
        checkpoint_interval: 50,
        ..AppConfig::default()
    }
}

fn seed(count: usize) -> impl Iterator<Item = SourceRecord> {
    (0..count).map(|i| {
        SourceRecord::new(format!("ref-{i}"), format!("  Company   {i} "))
            .with_tax_id(format!("77070{:05}", i % 250))
    })
}

fn engine_with<S, N>(
    store: Arc<S>,
    normalizer: Arc<N>,
    enrichers: Vec<Arc<dyn Enricher>>,
) -> NormalizationEngine
where
    S: SessionStore + RecordSource + 'static,
    N: RecordNormalizer + 'static,
{
    let config = config();
    let cache = Arc::new(ResultCache::new(config.cache.clone()));
    NormalizationEngine::new(
        config,
        store.clone(),
        store,
        normalizer,
        EnricherChain::new(enrichers, cache),
    )
}

fn drain_progress(events: &mut Receiver<SessionEvent>, session_id: i64) -> Vec<u64> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Progress {
            session_id: id,
            processed,
            ..
        } = event
        {
            if id == session_id {
                seen.push(processed);
            }
        }
    }
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_and_resume_process_every_record_exactly_once() {
    let store = Arc::new(MemoryStore::default());
    store.seed("db", seed(1000));
    let normalizer = Arc::new(Tracking::new(
        StoreNormalizer::new(store.clone()),
        Duration::from_millis(2),
    ));
    let engine = engine_with(store.clone(), normalizer.clone(), Vec::new());
    let mut events = engine.subscribe();

    let handle = engine
        .start_session("db", SessionOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let first = engine.stop_session(handle.session_id).unwrap();
    let second = engine.stop_session(handle.session_id).unwrap();
    assert_eq!(first.status, SessionStatus::Stopped);
    assert_eq!(second.status, SessionStatus::Stopped);

    let stopped = engine.wait(handle.session_id).await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert!(stopped.processed <= stopped.total);
    assert!(stopped.processed < 1000);
    assert_eq!(stopped.message, format!("stopped, {} of 1000 processed", stopped.processed));
    assert_eq!(
        normalizer.offsets("db"),
        (0..stopped.processed).collect::<Vec<_>>()
    );

    let resumed = engine.resume_session(handle.session_id).await.unwrap();
    assert_eq!(resumed.resume_offset, stopped.processed);
    let done = engine.wait(handle.session_id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.processed, 1000);
    assert_eq!(normalizer.offsets("db"), (0..1000).collect::<Vec<_>>());
    assert_eq!(store.normalized_records("db").len(), 1000);

    let progress = drain_progress(&mut events, handle.session_id);
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(progress.iter().all(|processed| *processed <= 1000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopping_one_database_leaves_siblings_running() {
    let store = Arc::new(MemoryStore::default());
    store.seed("left", seed(400));
    store.seed("right", seed(400));
    let normalizer = Arc::new(Tracking::new(
        StoreNormalizer::new(store.clone()),
        Duration::from_millis(2),
    ));
    let engine = engine_with(store.clone(), normalizer.clone(), Vec::new());

    let started = engine
        .start_batch(vec![
            ("left".to_string(), SessionOptions::default()),
            ("right".to_string(), SessionOptions { priority: 1, ..SessionOptions::default() }),
        ])
        .await;
    let ids: Vec<i64> = started
        .into_iter()
        .map(|(_, handle)| handle.unwrap().session_id)
        .collect();

    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.stop_session(ids[0]).unwrap();

    let left = engine.wait(ids[0]).await.unwrap();
    let right = engine.wait(ids[1]).await.unwrap();
    assert_eq!(left.status, SessionStatus::Stopped);
    assert!(left.processed < 400);
    assert_eq!(right.status, SessionStatus::Completed);
    assert_eq!(normalizer.offsets("right"), (0..400).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_session_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("normalizer.db");
    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        store.import_records("db", &seed(300).collect::<Vec<_>>()).unwrap();
    }

    let session_id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let normalizer = Arc::new(Tracking::new(
            StoreNormalizer::new(store.clone()),
            Duration::from_millis(3),
        ));
        let engine = engine_with(store, normalizer, Vec::new());
        let handle = engine
            .start_session("db", SessionOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.stop_session(handle.session_id).unwrap();
        let report = engine.wait(handle.session_id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Stopped);
        assert!(report.processed < 300);
        handle.session_id
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let normalizer = Arc::new(Tracking::new(
        StoreNormalizer::new(store.clone()),
        Duration::ZERO,
    ));
    let engine = engine_with(store.clone(), normalizer.clone(), Vec::new());
    let stored = engine.status(session_id).unwrap();
    assert_eq!(stored.status, SessionStatus::Stopped);

    let handle = engine
        .start_session("db", SessionOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.session_id, session_id);
    assert!(handle.resumed);
    assert_eq!(handle.resume_offset, stored.processed);

    let done = engine.wait(session_id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(
        normalizer.offsets("db"),
        (stored.processed..300).collect::<Vec<_>>()
    );
    assert_eq!(store.normalized_records("db").unwrap().len(), 300);
    assert!(!store.duplicate_groups("db").unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resumed_session_keeps_its_options_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("normalizer.db");
    SqliteStore::open(&path)
        .unwrap()
        .import_records("db", &seed(200).collect::<Vec<_>>())
        .unwrap();
    let options = SessionOptions {
        enrich: true,
        worker_count: Some(2),
        ..SessionOptions::default()
    };

    let session_id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let normalizer = Arc::new(Tracking::new(
            StoreNormalizer::new(store.clone()),
            Duration::from_millis(3),
        ));
        let engine = engine_with(store, normalizer, vec![Arc::new(Registry) as Arc<dyn Enricher>]);
        let handle = engine.start_session("db", options.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.stop_session(handle.session_id).unwrap();
        let report = engine.wait(handle.session_id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Stopped);
        assert!(report.processed < 200);
        handle.session_id
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let normalizer = Arc::new(Tracking::new(
        StoreNormalizer::new(store.clone()),
        Duration::ZERO,
    ));
    let engine = engine_with(
        store.clone(),
        normalizer,
        vec![Arc::new(Registry) as Arc<dyn Enricher>],
    );

    let handle = engine.resume_session(session_id).await.unwrap();
    assert_eq!(handle.options, options);
    let done = engine.wait(session_id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);

    let rows = store.normalized_records("db").unwrap();
    assert_eq!(rows.len(), 200);
    assert!(rows
        .iter()
        .all(|row| row.enrichment.as_ref().map(|e| e.source.as_str()) == Some("registry")));
    assert!(rows.iter().all(|row| row.normalized_name.starts_with("ООО Реестр")));
}
