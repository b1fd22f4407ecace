use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::chain::EnricherChain;
use crate::enrichment::{non_empty, EnrichmentResult, TaxId};
use crate::errors::AppResult;
use crate::pool::RecordHandler;
use crate::store::{NormalizedSink, SourceRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub database_ref: String,
    pub offset: u64,
    pub reference: String,
    pub name: String,
    pub normalized_name: String,
    pub tax_id: Option<String>,
    pub enrichment: Option<EnrichmentResult>,
}

/// Domain step plugged into the pool. Everything except `normalize` and
/// `persist` has a usable default.
#[async_trait]
pub trait RecordNormalizer: Send + Sync {
    async fn normalize(&self, database_ref: &str, record: &SourceRecord) -> AppResult<NormalizedRecord>;

    async fn apply_enrichment(
        &self,
        record: &mut NormalizedRecord,
        best: &EnrichmentResult,
    ) -> AppResult<()> {
        record.enrichment = Some(best.clone());
        Ok(())
    }

    async fn persist(&self, record: NormalizedRecord) -> AppResult<()>;

    async fn analyze_duplicates(&self, _database_ref: &str) -> AppResult<usize> {
        Ok(0)
    }
}

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Default normalizer: tidies names and writes rows to a sink.
pub struct StoreNormalizer<S> {
    sink: Arc<S>,
}

impl<S: NormalizedSink> StoreNormalizer<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S: NormalizedSink + 'static> RecordNormalizer for StoreNormalizer<S> {
    async fn normalize(&self, database_ref: &str, record: &SourceRecord) -> AppResult<NormalizedRecord> {
        Ok(NormalizedRecord {
            database_ref: database_ref.to_string(),
            offset: record.offset,
            reference: record.reference.clone(),
            name: record.name.clone(),
            normalized_name: collapse_whitespace(&record.name),
            tax_id: non_empty(record.tax_id.clone()),
            enrichment: None,
        })
    }

    async fn apply_enrichment(
        &self,
        record: &mut NormalizedRecord,
        best: &EnrichmentResult,
    ) -> AppResult<()> {
        if let Some(name) = best
            .fields
            .short_name
            .as_deref()
            .or(best.fields.full_name.as_deref())
        {
            record.normalized_name = collapse_whitespace(name);
        }
        record.enrichment = Some(best.clone());
        Ok(())
    }

    async fn persist(&self, record: NormalizedRecord) -> AppResult<()> {
        self.sink.upsert_normalized(&record)
    }

    async fn analyze_duplicates(&self, database_ref: &str) -> AppResult<usize> {
        Ok(self.sink.duplicate_groups(database_ref)?.len())
    }
}

/// The per-record handler a session's pool runs.
pub struct NormalizeRecord {
    database_ref: String,
    normalizer: Arc<dyn RecordNormalizer>,
    chain: Option<Arc<EnricherChain>>,
}

impl NormalizeRecord {
    pub fn new(database_ref: impl Into<String>, normalizer: Arc<dyn RecordNormalizer>) -> Self {
        Self {
            database_ref: database_ref.into(),
            normalizer,
            chain: None,
        }
    }

    pub fn with_enrichment(mut self, chain: Arc<EnricherChain>) -> Self {
        self.chain = Some(chain);
        self
    }
}

#[async_trait]
impl RecordHandler for NormalizeRecord {
    async fn handle(&self, record: SourceRecord) -> AppResult<()> {
        let mut normalized = self.normalizer.normalize(&self.database_ref, &record).await?;

        if let (Some(chain), Some(raw)) = (self.chain.as_ref(), normalized.tax_id.clone()) {
            let id = TaxId::parse(&raw)?;
            let response = chain.enrich(&id).await;
            match chain.best_result(&response.results) {
                Some(best) => self.normalizer.apply_enrichment(&mut normalized, best).await?,
                None => trace!(offset = record.offset, id = %id, errors = ?response.errors, "no enrichment result"),
            }
        }

        self.normalizer.persist(normalized).await
    }

    async fn analyze_duplicates(&self) -> AppResult<usize> {
        self.normalizer.analyze_duplicates(&self.database_ref).await
    }
}
