use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 50;
pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 100;
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_MAX_TOTAL_WORKERS: usize = 16;
const DEFAULT_ENRICHMENT_BATCH_SIZE: usize = 25;
const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CACHE_CLEANUP_SECS: u64 = 60 * 60;
const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60 * 60;

/// External registries the engine knows how to query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Dadata,
    Adata,
    Gisp,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Dadata, SourceKind::Adata, SourceKind::Gisp];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Dadata => "dadata",
            SourceKind::Adata => "adata",
            SourceKind::Gisp => "gisp",
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            SourceKind::Dadata => "DADATA",
            SourceKind::Adata => "ADATA",
            SourceKind::Gisp => "GISP",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            SourceKind::Dadata => "https://suggestions.dadata.ru",
            SourceKind::Adata => "https://api.adata.kz",
            SourceKind::Gisp => "https://gisp.gov.ru",
        }
    }

    fn default_priority(&self) -> i32 {
        match self {
            SourceKind::Dadata => 1,
            SourceKind::Adata => 2,
            SourceKind::Gisp => 3,
        }
    }
}

/// Static per-source settings, loaded once at startup.
#[derive(Clone, Debug)]
pub struct EnricherDescriptor {
    pub kind: SourceKind,
    pub enabled: bool,
    pub priority: i32,
    pub max_requests_per_minute: u32,
    pub api_key: Option<SecretString>,
    pub secret_key: Option<SecretString>,
    pub base_url: String,
    pub timeout: Duration,
}

impl EnricherDescriptor {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            enabled: true,
            priority: kind.default_priority(),
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            api_key: None,
            secret_key: None,
            base_url: kind.default_base_url().to_string(),
            timeout: Duration::from_secs(DEFAULT_SOURCE_TIMEOUT_SECS),
        }
    }

    fn from_env(kind: SourceKind) -> Self {
        let prefix = kind.env_prefix();
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        Self {
            kind,
            enabled: parse_bool(&key("ENABLED"), true),
            priority: parse_i32(&key("PRIORITY"), kind.default_priority()),
            max_requests_per_minute: clamp_requests_per_minute(parse_u32(
                &key("MAX_REQUESTS_PER_MINUTE"),
                DEFAULT_MAX_REQUESTS_PER_MINUTE,
            )),
            api_key: parse_secret(&key("API_KEY")),
            secret_key: parse_secret(&key("SECRET_KEY")),
            base_url: env::var(key("BASE_URL"))
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| kind.default_base_url().to_string()),
            timeout: Duration::from_secs(
                parse_u64(&key("TIMEOUT_SECS"), DEFAULT_SOURCE_TIMEOUT_SECS).max(1),
            ),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_requests_per_minute(mut self, max: u32) -> Self {
        self.max_requests_per_minute = clamp_requests_per_minute(max);
        self
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CACHE_CLEANUP_SECS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_file_name: String,
    pub worker_count: usize,
    pub max_total_workers: usize,
    pub checkpoint_interval: usize,
    pub enrichment_batch_size: usize,
    /// A running session with no live pool and no checkpoint for this long
    /// is treated as abandoned.
    pub session_timeout: Duration,
    pub cache: CacheConfig,
    pub enrichers: Vec<EnricherDescriptor>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicSourceProfile {
    pub name: &'static str,
    pub enabled: bool,
    pub priority: i32,
    pub max_requests_per_minute: u32,
    pub base_url: String,
    pub has_api_key: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub worker_count: usize,
    pub max_total_workers: usize,
    pub checkpoint_interval: usize,
    pub enrichment_batch_size: usize,
    pub session_timeout_secs: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub sources: Vec<PublicSourceProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_file_name: "normalizer.db".to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
            max_total_workers: DEFAULT_MAX_TOTAL_WORKERS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            enrichment_batch_size: DEFAULT_ENRICHMENT_BATCH_SIZE,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            cache: CacheConfig::default(),
            enrichers: SourceKind::ALL
                .iter()
                .map(|kind| EnricherDescriptor::new(*kind))
                .collect(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "normalizer.db".to_string()),
            worker_count: parse_usize("NORMALIZER_WORKER_COUNT", DEFAULT_WORKER_COUNT).max(1),
            max_total_workers: parse_usize(
                "NORMALIZER_MAX_TOTAL_WORKERS",
                DEFAULT_MAX_TOTAL_WORKERS,
            )
            .max(1),
            checkpoint_interval: parse_usize(
                "NORMALIZER_CHECKPOINT_INTERVAL",
                DEFAULT_CHECKPOINT_INTERVAL,
            )
            .max(1),
            enrichment_batch_size: parse_usize(
                "NORMALIZER_ENRICHMENT_BATCH_SIZE",
                DEFAULT_ENRICHMENT_BATCH_SIZE,
            )
            .max(1),
            session_timeout: Duration::from_secs(
                parse_u64("NORMALIZER_SESSION_TIMEOUT_SECS", DEFAULT_SESSION_TIMEOUT_SECS).max(1),
            ),
            cache: CacheConfig {
                enabled: parse_bool("ENRICHMENT_CACHE_ENABLED", true),
                ttl: Duration::from_secs(parse_u64(
                    "ENRICHMENT_CACHE_TTL_SECS",
                    DEFAULT_CACHE_TTL_SECS,
                )),
                cleanup_interval: Duration::from_secs(parse_u64(
                    "ENRICHMENT_CACHE_CLEANUP_SECS",
                    DEFAULT_CACHE_CLEANUP_SECS,
                )),
            },
            enrichers: SourceKind::ALL
                .iter()
                .map(|kind| EnricherDescriptor::from_env(*kind))
                .collect(),
        }
    }

    pub fn descriptor(&self, kind: SourceKind) -> Option<&EnricherDescriptor> {
        self.enrichers.iter().find(|d| d.kind == kind)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            worker_count: self.worker_count,
            max_total_workers: self.max_total_workers,
            checkpoint_interval: self.checkpoint_interval,
            enrichment_batch_size: self.enrichment_batch_size,
            session_timeout_secs: self.session_timeout.as_secs(),
            cache_enabled: self.cache.enabled,
            cache_ttl_secs: self.cache.ttl.as_secs(),
            sources: self
                .enrichers
                .iter()
                .map(|d| PublicSourceProfile {
                    name: d.kind.as_str(),
                    enabled: d.enabled,
                    priority: d.priority,
                    max_requests_per_minute: d.max_requests_per_minute,
                    base_url: d.base_url.clone(),
                    has_api_key: d.api_key.is_some(),
                })
                .collect(),
        }
    }
}

pub fn clamp_requests_per_minute(value: u32) -> u32 {
    if value == 0 {
        DEFAULT_MAX_REQUESTS_PER_MINUTE
    } else {
        value
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_i32(key: &str, default: i32) -> i32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("DADATA_API_KEY", "secret");
        env::set_var("ADATA_MAX_REQUESTS_PER_MINUTE", "0");
        env::set_var("GISP_PRIORITY", "7");
        env::set_var("NORMALIZER_WORKER_COUNT", "0");
        env::set_var("NORMALIZER_CHECKPOINT_INTERVAL", "10");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.worker_count, 1);
        assert_eq!(public.checkpoint_interval, 10);
        assert!(config.descriptor(SourceKind::Dadata).unwrap().api_key.is_some());

        let dadata = public.sources.iter().find(|s| s.name == "dadata").unwrap();
        assert!(dadata.has_api_key);
        let adata = public.sources.iter().find(|s| s.name == "adata").unwrap();
        assert_eq!(adata.max_requests_per_minute, DEFAULT_MAX_REQUESTS_PER_MINUTE);
        let gisp = public.sources.iter().find(|s| s.name == "gisp").unwrap();
        assert_eq!(gisp.priority, 7);

        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn defaults_follow_source_ordering() {
        let config = AppConfig::default();
        let priorities: Vec<_> = config.enrichers.iter().map(|d| d.priority).collect();
        assert_eq!(priorities, vec![1, 2, 3]);
        assert_eq!(config.checkpoint_interval, DEFAULT_CHECKPOINT_INTERVAL);
        assert!(config.cache.enabled);
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn descriptor_builders_override_defaults() {
        let descriptor = EnricherDescriptor::new(SourceKind::Adata)
            .with_priority(0)
            .with_max_requests_per_minute(0)
            .with_base_url("http://localhost:8080/");
        assert_eq!(descriptor.priority, 0);
        assert_eq!(descriptor.max_requests_per_minute, DEFAULT_MAX_REQUESTS_PER_MINUTE);
        assert_eq!(descriptor.base_url, "http://localhost:8080");
        assert!(descriptor.api_key.is_none());

        let descriptor = descriptor.with_max_requests_per_minute(30);
        assert_eq!(descriptor.max_requests_per_minute, 30);
    }
}
