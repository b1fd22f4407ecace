use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{info, warn};

use crate::cache::{CacheStats, ResultCache, SweepHandle};
use crate::chain::{EnricherChain, SourceStats};
use crate::config::AppConfig;
use crate::enrichment::{EnrichmentResponse, TaxId};
use crate::errors::AppResult;
use crate::pipeline::{NormalizeRecord, RecordNormalizer, StoreNormalizer};
use crate::pool::{CheckpointedWorkerPool, PoolOptions, PoolProgress, PoolSummary};
use crate::session::{
    NormalizationSession, SessionController, SessionHandle, SessionOptions, SessionStatus,
};
use crate::store::{RecordSource, SessionStore, SqliteStore};

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: i64,
        database_ref: String,
        total: u64,
    },
    Progress {
        session_id: i64,
        processed: u64,
        total: u64,
    },
    Stopped {
        session_id: i64,
        processed: u64,
        total: u64,
    },
    Resumed {
        session_id: i64,
        processed: u64,
        total: u64,
    },
    Completed {
        session_id: i64,
        processed: u64,
        total: u64,
        errors: u64,
        duplicate_groups: Option<usize>,
    },
    Failed {
        session_id: i64,
        error: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub session_id: i64,
    pub database_ref: String,
    pub status: SessionStatus,
    pub processed: u64,
    pub total: u64,
    pub errors: u64,
    pub progress_percent: f64,
    pub last_error: Option<String>,
    pub message: String,
}

impl From<&NormalizationSession> for StatusReport {
    fn from(session: &NormalizationSession) -> Self {
        let message = match session.status {
            SessionStatus::Stopped => format!(
                "stopped, {} of {} processed",
                session.processed, session.total
            ),
            SessionStatus::Failed => format!(
                "failed: {}",
                session.last_error.as_deref().unwrap_or("unknown error")
            ),
            status => format!("{status}, {} of {} processed", session.processed, session.total),
        };
        Self {
            session_id: session.id,
            database_ref: session.database_ref.clone(),
            status: session.status,
            processed: session.processed,
            total: session.total,
            errors: session.errors,
            progress_percent: session.progress_percent(),
            last_error: session.last_error.clone(),
            message,
        }
    }
}

/// Entry point for collaborators: starts, stops, resumes and reports on
/// normalization sessions, and exposes single-identifier enrichment.
pub struct NormalizationEngine {
    config: AppConfig,
    controller: Arc<SessionController>,
    source: Arc<dyn RecordSource>,
    normalizer: Arc<dyn RecordNormalizer>,
    chain: Arc<EnricherChain>,
    budget: Arc<Semaphore>,
    events: broadcast::Sender<SessionEvent>,
    /// Flips to true once a session's current pool has drained.
    runs: Mutex<HashMap<i64, watch::Receiver<bool>>>,
    _sweeper: Option<SweepHandle>,
}

impl NormalizationEngine {
    /// Must be called inside a tokio runtime; the cache sweeper is spawned
    /// here.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn SessionStore>,
        source: Arc<dyn RecordSource>,
        normalizer: Arc<dyn RecordNormalizer>,
        chain: EnricherChain,
    ) -> Self {
        let sweeper = chain.cache().spawn_sweeper();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            budget: Arc::new(Semaphore::new(config.max_total_workers.max(1))),
            config,
            controller: Arc::new(SessionController::new(store)),
            source,
            normalizer,
            chain: Arc::new(chain),
            events,
            runs: Mutex::new(HashMap::new()),
            _sweeper: sweeper,
        }
    }

    /// SQLite-backed engine with the configured enrichers and the default
    /// normalizer.
    pub fn open<P: AsRef<Path>>(config: AppConfig, data_dir: P) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let store = Arc::new(SqliteStore::open(data_dir.join(&config.database_file_name))?);
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let chain = EnricherChain::from_config(&config, cache)?;
        let normalizer = Arc::new(StoreNormalizer::new(Arc::clone(&store)));
        Ok(Self::new(config, store.clone(), store, normalizer, chain))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn start_session(
        &self,
        database_ref: &str,
        options: SessionOptions,
    ) -> AppResult<SessionHandle> {
        if let Some(previous) = self.controller.latest_for_database(database_ref) {
            if previous.status == SessionStatus::Stopped {
                self.settle(previous.id).await;
            }
        }

        let total = self.source.total(database_ref)?;
        let handle = self.controller.start(database_ref, total, &options)?;
        let event = if handle.resumed {
            SessionEvent::Resumed {
                session_id: handle.session_id,
                processed: handle.resume_offset,
                total: handle.total,
            }
        } else {
            SessionEvent::Started {
                session_id: handle.session_id,
                database_ref: handle.database_ref.clone(),
                total: handle.total,
            }
        };
        self.emit(event);
        self.spawn_run(handle.clone());
        Ok(handle)
    }

    /// Starts one session per database, lowest priority value first. All of
    /// them draw from the same worker budget.
    pub async fn start_batch(
        &self,
        requests: Vec<(String, SessionOptions)>,
    ) -> Vec<(String, AppResult<SessionHandle>)> {
        let mut requests = requests;
        requests.sort_by_key(|(_, options)| options.priority);
        let mut started = Vec::with_capacity(requests.len());
        for (database_ref, options) in requests {
            let outcome = self.start_session(&database_ref, options).await;
            if let Err(err) = &outcome {
                warn!(database = %database_ref, error = %err, "batch session did not start");
            }
            started.push((database_ref, outcome));
        }
        started
    }

    pub fn stop_session(&self, session_id: i64) -> AppResult<StatusReport> {
        let session = self.controller.stop(session_id)?;
        Ok(StatusReport::from(&session))
    }

    /// Continues a stopped session with the options it was started with.
    pub async fn resume_session(&self, session_id: i64) -> AppResult<SessionHandle> {
        self.settle(session_id).await;
        let handle = self.controller.resume(session_id)?;
        self.emit(SessionEvent::Resumed {
            session_id,
            processed: handle.resume_offset,
            total: handle.total,
        });
        self.spawn_run(handle.clone());
        Ok(handle)
    }

    /// Stops sessions left running by an exited process once they have been
    /// idle for the configured session timeout.
    pub fn stop_stale_sessions(&self) -> AppResult<Vec<StatusReport>> {
        let stopped = self.controller.stop_stale(self.config.session_timeout)?;
        for session in &stopped {
            self.emit(SessionEvent::Stopped {
                session_id: session.id,
                processed: session.processed,
                total: session.total,
            });
        }
        Ok(stopped.iter().map(StatusReport::from).collect())
    }

    pub fn status(&self, session_id: i64) -> AppResult<StatusReport> {
        let session = self.controller.status(session_id)?;
        Ok(StatusReport::from(&session))
    }

    /// Stored sessions in `status`, including ones from earlier processes.
    pub fn sessions_with_status(&self, status: SessionStatus) -> AppResult<Vec<StatusReport>> {
        Ok(self
            .controller
            .sessions_with_status(status)?
            .iter()
            .map(StatusReport::from)
            .collect())
    }

    /// Sessions this process has started, stopped or resumed.
    pub fn sessions(&self) -> Vec<StatusReport> {
        self.controller
            .sessions()
            .iter()
            .map(StatusReport::from)
            .collect()
    }

    /// Waits until the session's current pool has drained, then reports.
    pub async fn wait(&self, session_id: i64) -> AppResult<StatusReport> {
        self.settle(session_id).await;
        self.status(session_id)
    }

    pub async fn enrich_one(&self, identifier: &str) -> AppResult<EnrichmentResponse> {
        let id = TaxId::parse(identifier)?;
        Ok(self.chain.enrich(&id).await)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.chain.cache_stats()
    }

    pub fn available_sources(&self) -> Vec<String> {
        self.chain.available_sources()
    }

    pub fn source_stats(&self) -> Vec<SourceStats> {
        self.chain.source_stats()
    }

    async fn settle(&self, session_id: i64) {
        let done = self.runs.lock().get(&session_id).cloned();
        if let Some(mut done) = done {
            // A dropped sender means the runner is gone either way.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn spawn_run(&self, handle: SessionHandle) {
        let session_id = handle.session_id;
        let options = handle.options.clone();
        let (done_tx, done_rx) = watch::channel(false);
        self.runs.lock().insert(session_id, done_rx);

        let mut handler = NormalizeRecord::new(handle.database_ref.clone(), Arc::clone(&self.normalizer));
        if options.enrich {
            handler = handler.with_enrichment(Arc::clone(&self.chain));
        }

        let observer = {
            let controller = Arc::clone(&self.controller);
            let events = self.events.clone();
            let prior_errors = handle.prior_errors;
            Arc::new(move |progress: PoolProgress| {
                let errors = prior_errors + progress.errors;
                if let Err(err) = controller.record_progress(session_id, progress.processed, errors) {
                    warn!(session_id, error = %err, "failed to persist checkpoint");
                }
                let _ = events.send(SessionEvent::Progress {
                    session_id,
                    processed: progress.processed,
                    total: progress.total,
                });
            })
        };
        let pool = CheckpointedWorkerPool::new(
            handle.database_ref.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.budget),
            PoolOptions {
                worker_count: options.worker_count.unwrap_or(self.config.worker_count).max(1),
                checkpoint_interval: self.config.checkpoint_interval,
                enrichment_batch_size: options.enrich.then_some(self.config.enrichment_batch_size),
                ..PoolOptions::default()
            },
        )
        .with_observer(observer);

        let controller = Arc::clone(&self.controller);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = pool
                .run(handle.resume_offset, handle.total, handle.cancel.clone(), Arc::new(handler))
                .await;
            let event = finish_run(&controller, &handle, outcome);
            controller.release_pool(session_id);
            let _ = events.send(event);
            let _ = done_tx.send(true);
        });
    }
}

fn finish_run(
    controller: &SessionController,
    handle: &SessionHandle,
    outcome: AppResult<PoolSummary>,
) -> SessionEvent {
    let session_id = handle.session_id;
    let summary = match outcome {
        Ok(summary) => summary,
        Err(err) => {
            let message = err.to_string();
            if let Err(store_err) = controller.fail(session_id, &message) {
                warn!(session_id, error = %store_err, "failed to persist session failure");
            }
            return SessionEvent::Failed {
                session_id,
                error: message,
            };
        }
    };

    let errors = handle.prior_errors + summary.errors;
    if let Err(err) = controller.record_progress(session_id, summary.processed, errors) {
        warn!(session_id, error = %err, "failed to persist final progress");
    }

    let session = if summary.stopped {
        controller.status(session_id)
    } else {
        controller.complete(session_id)
    };
    match session {
        Ok(session) if session.status == SessionStatus::Completed => {
            info!(
                session_id,
                database = %session.database_ref,
                processed = session.processed,
                duplicate_groups = ?summary.duplicate_groups,
                "session finished"
            );
            SessionEvent::Completed {
                session_id,
                processed: session.processed,
                total: session.total,
                errors: session.errors,
                duplicate_groups: summary.duplicate_groups,
            }
        }
        Ok(session) => {
            info!(
                session_id,
                processed = session.processed,
                total = session.total,
                "session drained after stop"
            );
            SessionEvent::Stopped {
                session_id,
                processed: session.processed,
                total: session.total,
            }
        }
        Err(err) => SessionEvent::Failed {
            session_id,
            error: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichers::Enricher;
    use crate::enrichment::{EnrichmentResult, ResolvedFields};
    use crate::errors::AppError;
    use crate::store::{MemoryStore, SourceRecord};

    fn engine(store: &Arc<MemoryStore>) -> NormalizationEngine {
        let config = AppConfig {
            worker_count: 2,
            checkpoint_interval: 5,
            ..AppConfig::default()
        };
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        NormalizationEngine::new(
            config,
            store.clone(),
            store.clone(),
            Arc::new(StoreNormalizer::new(store.clone())),
            EnricherChain::new(Vec::new(), cache),
        )
    }

    fn seed(store: &MemoryStore, database_ref: &str, count: usize) {
        store.seed(
            database_ref,
            (0..count).map(|i| SourceRecord::new(format!("{database_ref}-{i}"), format!("Company {i}"))),
        );
    }

    #[tokio::test]
    async fn completes_a_session() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "db", 40);
        let engine = engine(&store);
        let mut events = engine.subscribe();

        let handle = engine.start_session("db", SessionOptions::default()).await.unwrap();
        let report = engine.wait(handle.session_id).await.unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.processed, 40);
        assert!((report.progress_percent - 100.0).abs() < 1e-9);
        assert_eq!(store.normalized_records("db").len(), 40);

        let first = events.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::Started { total: 40, .. }));
    }

    struct Registry;

    #[async_trait::async_trait]
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
                    short_name: Some(format!("ООО  Реестр {id}")),
                    ..ResolvedFields::default()
                },
                0.9,
            )
        }
    }

    #[tokio::test]
    async fn enriched_session_applies_best_results() {
        let store = Arc::new(MemoryStore::default());
        store.seed(
            "db",
            (0..30).map(|i| {
                SourceRecord::new(format!("db-{i}"), format!("Company {i}"))
                    .with_tax_id(format!("77070{i:05}"))
            }),
        );
        let config = AppConfig {
            worker_count: 2,
            checkpoint_interval: 50,
            enrichment_batch_size: 4,
            ..AppConfig::default()
        };
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let engine = NormalizationEngine::new(
            config,
            store.clone(),
            store.clone(),
            Arc::new(StoreNormalizer::new(store.clone())),
            EnricherChain::new(vec![Arc::new(Registry) as Arc<dyn Enricher>], cache),
        );

        let handle = engine
            .start_session(
                "db",
                SessionOptions {
                    enrich: true,
                    ..SessionOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(handle.options.enrich);
        let report = engine.wait(handle.session_id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Completed);

        let rows = store.normalized_records("db");
        assert_eq!(rows.len(), 30);
        for row in &rows {
            let tax_id = row.tax_id.as_deref().unwrap();
            assert_eq!(row.enrichment.as_ref().unwrap().source, "registry");
            assert_eq!(row.normalized_name, format!("ООО Реестр {tax_id}"));
        }
        assert_eq!(engine.cache_stats().size, 30);
    }

    #[tokio::test]
    async fn stale_sessions_become_resumable() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "db", 20);
        let orphan = {
            let controller = SessionController::new(store.clone());
            let handle = controller.start("db", 20, &SessionOptions::default()).unwrap();
            controller.record_progress(handle.session_id, 8, 0).unwrap();
            handle.session_id
        };
        let mut row = store.load(orphan).unwrap().unwrap();
        row.last_activity_at = chrono::Utc::now() - chrono::Duration::hours(3);
        store.save(&row).unwrap();

        let engine = engine(&store);
        let mut events = engine.subscribe();
        assert_eq!(
            engine.sessions_with_status(SessionStatus::Running).unwrap()[0].session_id,
            orphan
        );

        let stopped = engine.stop_stale_sessions().unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].message, "stopped, 8 of 20 processed");
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Stopped { processed: 8, .. }
        ));
        assert!(engine.sessions_with_status(SessionStatus::Running).unwrap().is_empty());

        let resumed = engine.resume_session(orphan).await.unwrap();
        assert_eq!(resumed.resume_offset, 8);
        let report = engine.wait(orphan).await.unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(store.normalized_records("db").len(), 12);
    }

    #[tokio::test]
    async fn rejects_a_second_start_while_running() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "db", 2000);
        let engine = engine(&store);

        let handle = engine.start_session("db", SessionOptions::default()).await.unwrap();
        let second = engine.start_session("db", SessionOptions::default()).await;
        assert!(matches!(second, Err(AppError::AlreadyRunning(_))));

        engine.stop_session(handle.session_id).unwrap();
        engine.wait(handle.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_source_fails_session() {
        let store = Arc::new(MemoryStore::default());
        seed(&store, "db", 10);
        store.set_unreadable("db", true);
        let engine = engine(&store);

        let handle = engine.start_session("db", SessionOptions::default()).await.unwrap();
        let report = engine.wait(handle.session_id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Failed);
        assert!(report.last_error.unwrap().contains("cannot be read"));
        assert!(report.message.starts_with("failed"));
    }

    #[tokio::test]
    async fn enrich_one_rejects_malformed_identifiers() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine(&store);
        assert!(matches!(
            engine.enrich_one("12ab").await,
            Err(AppError::InvalidIdentifier(_))
        ));

        let response = engine.enrich_one("7707083893").await.unwrap();
        assert!(!response.success);
        assert!(response.errors[0].contains("no available enrichers"));
        assert!(engine.available_sources().is_empty());
    }

    #[tokio::test]
    async fn batch_starts_in_priority_order() {
        let store = Arc::new(MemoryStore::default());
        for db in ["low", "high", "mid"] {
            seed(&store, db, 5);
        }
        let engine = engine(&store);

        let started = engine
            .start_batch(vec![
                ("low".into(), SessionOptions { priority: 9, ..SessionOptions::default() }),
                ("high".into(), SessionOptions { priority: 1, ..SessionOptions::default() }),
                ("mid".into(), SessionOptions { priority: 5, ..SessionOptions::default() }),
            ])
            .await;
        let order: Vec<_> = started.iter().map(|(db, _)| db.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);

        for (_, handle) in started {
            let report = engine.wait(handle.unwrap().session_id).await.unwrap();
            assert_eq!(report.status, SessionStatus::Completed);
        }
    }

    #[test]
    fn stopped_report_reads_as_partial_progress() {
        let session = NormalizationSession {
            id: 1,
            database_ref: "db".into(),
            status: SessionStatus::Stopped,
            processed: 120,
            total: 1000,
            errors: 0,
            priority: 0,
            enrich: false,
            worker_count: None,
            last_error: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
            last_activity_at: chrono::Utc::now(),
        };
        let report = StatusReport::from(&session);
        assert_eq!(report.message, "stopped, 120 of 1000 processed");
        assert!((report.progress_percent - 12.0).abs() < 1e-9);
    }
}
