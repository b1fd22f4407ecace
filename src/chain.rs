use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{CacheStats, ResultCache};
use crate::config::AppConfig;
use crate::enrichers::{build_enrichers, Enricher};
use crate::enrichment::{EnrichmentResponse, EnrichmentResult, TaxId};
use crate::errors::AppResult;

/// A successful result at or above this confidence ends the fallback walk.
pub const GOOD_ENOUGH_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub name: String,
    pub available: bool,
    pub priority: i32,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Priority-ordered fallback over the registered enrichers.
pub struct EnricherChain {
    enrichers: Vec<Arc<dyn Enricher>>,
    cache: Arc<ResultCache>,
}

impl EnricherChain {
    /// Sorts once, ascending by priority. Ties keep registration order.
    pub fn new(mut enrichers: Vec<Arc<dyn Enricher>>, cache: Arc<ResultCache>) -> Self {
        enrichers.sort_by_key(|enricher| enricher.priority());
        Self { enrichers, cache }
    }

    pub fn from_config(config: &AppConfig, cache: Arc<ResultCache>) -> AppResult<Self> {
        let chain = Self::new(build_enrichers(config)?, cache);
        info!(
            sources = ?chain.available_sources(),
            "enrichment chain initialized"
        );
        Ok(chain)
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Enrichers that could handle `id` right now, in attempt order.
    pub fn candidates(&self, id: &TaxId) -> Vec<Arc<dyn Enricher>> {
        self.enrichers
            .iter()
            .filter(|enricher| enricher.is_available() && enricher.supports(id))
            .cloned()
            .collect()
    }

    pub async fn enrich(&self, id: &TaxId) -> EnrichmentResponse {
        let mut response = EnrichmentResponse::default();
        let candidates = self.candidates(id);
        if candidates.is_empty() {
            response
                .errors
                .push(format!("no available enrichers for identifier {id}"));
            return response;
        }

        for enricher in candidates {
            let key = cache_key(enricher.name(), id);
            let result = match self.cache.get(&key) {
                Some(cached) => {
                    debug!(source = enricher.name(), id = %id, "enrichment cache hit");
                    cached
                }
                None => {
                    let fresh = enricher.enrich(id).await;
                    if fresh.success {
                        self.cache.set(key, fresh.clone());
                    }
                    fresh
                }
            };

            if let Some(error) = result.error.as_ref().filter(|_| !result.success) {
                response.errors.push(format!("{}: {}", result.source, error));
            }
            let good_enough = result.success && result.confidence >= GOOD_ENOUGH_CONFIDENCE;
            response.results.push(result);
            if good_enough {
                break;
            }
        }

        response.success = response.results.iter().any(|result| result.success);
        response
    }

    /// Highest `confidence + 0.1 * (10 - priority)` among successful results.
    pub fn best_result<'a>(&self, results: &'a [EnrichmentResult]) -> Option<&'a EnrichmentResult> {
        let mut best: Option<(&EnrichmentResult, f64)> = None;
        for result in results.iter().filter(|result| result.success) {
            let score = result.confidence + 0.1 * f64::from(10 - self.priority_of(&result.source));
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((result, score)),
            }
        }
        best.map(|(result, _)| result)
    }

    fn priority_of(&self, source: &str) -> i32 {
        self.enrichers
            .iter()
            .find(|enricher| enricher.name() == source)
            .map(|enricher| enricher.priority())
            .unwrap_or(10)
    }

    pub fn available_sources(&self) -> Vec<String> {
        self.enrichers
            .iter()
            .filter(|enricher| enricher.is_available())
            .map(|enricher| enricher.name().to_string())
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn source_stats(&self) -> Vec<SourceStats> {
        let cache = self.cache.stats();
        self.enrichers
            .iter()
            .map(|enricher| SourceStats {
                name: enricher.name().to_string(),
                available: enricher.is_available(),
                priority: enricher.priority(),
                cache_hits: cache.hits,
                cache_misses: cache.misses,
            })
            .collect()
    }
}

fn cache_key(source: &str, id: &TaxId) -> String {
    format!("{source}:{id}")
}
