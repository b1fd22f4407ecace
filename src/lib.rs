pub mod cache;
pub mod chain;
pub mod config;
pub mod engine;
pub mod enrichers;
pub mod enrichment;
pub mod errors;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod session;
pub mod store;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheStats, ResultCache};
pub use crate::chain::{EnricherChain, SourceStats};
pub use crate::config::{AppConfig, CacheConfig, EnricherDescriptor, SourceKind};
pub use crate::engine::{NormalizationEngine, SessionEvent, StatusReport};
pub use crate::enrichers::{build_enrichers, AdataEnricher, DadataEnricher, Enricher, GispEnricher};
pub use crate::enrichment::{
    detect_country, validate_bin, validate_inn, Country, EnrichmentResponse, EnrichmentResult,
    ResolvedFields, TaxId,
};
pub use crate::errors::{AppError, AppResult};
pub use crate::pipeline::{NormalizeRecord, NormalizedRecord, RecordNormalizer, StoreNormalizer};
pub use crate::pool::{CheckpointedWorkerPool, PoolOptions, PoolProgress, PoolSummary, RecordHandler};
pub use crate::rate_limit::RateLimiter;
pub use crate::session::{
    CancellationPredicate, NormalizationSession, SessionController, SessionHandle, SessionOptions,
    SessionStatus,
};
pub use crate::store::{
    DuplicateGroup, MemoryStore, NormalizedSink, RecordSource, SessionStore, SourceRecord,
    SqliteStore,
};

/// Installs the global subscriber once. Later calls are no-ops.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,counterparty_normalizer=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
