use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::config::{AppConfig, EnricherDescriptor, SourceKind};
use crate::enrichment::{non_empty, weighted_confidence, EnrichmentResult, ResolvedFields, TaxId};
use crate::errors::AppResult;
use crate::rate_limit::RateLimiter;

/// Uniform capability every external registry adapter provides.
///
/// `enrich` never fails: transport and decoding problems come back as a
/// result with `success == false` so the chain can move on.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn supports(&self, id: &TaxId) -> bool;
    fn is_available(&self) -> bool;
    async fn enrich(&self, id: &TaxId) -> EnrichmentResult;
}

/// Builds one adapter per configured source. Disabled or uncredentialed
/// sources are still registered and simply report themselves unavailable.
pub fn build_enrichers(config: &AppConfig) -> AppResult<Vec<Arc<dyn Enricher>>> {
    let mut enrichers: Vec<Arc<dyn Enricher>> = Vec::with_capacity(config.enrichers.len());
    for descriptor in &config.enrichers {
        let enricher: Arc<dyn Enricher> = match descriptor.kind {
            SourceKind::Dadata => Arc::new(DadataEnricher::new(descriptor.clone())?),
            SourceKind::Adata => Arc::new(AdataEnricher::new(descriptor.clone())?),
            SourceKind::Gisp => Arc::new(GispEnricher::new(descriptor.clone())?),
        };
        enrichers.push(enricher);
    }
    Ok(enrichers)
}

/// HTTP plumbing shared by the adapters: client with the source timeout plus
/// the source's private rate limiter.
struct SourceClient {
    descriptor: EnricherDescriptor,
    http: Client,
    limiter: RateLimiter,
}

impl SourceClient {
    fn new(descriptor: EnricherDescriptor) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent("counterparty-normalizer/0.1.0")
            .timeout(descriptor.timeout)
            .build()?;
        let limiter = RateLimiter::per_minute(descriptor.max_requests_per_minute);
        Ok(Self {
            descriptor,
            http,
            limiter,
        })
    }

    fn name(&self) -> &'static str {
        self.descriptor.kind.as_str()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.descriptor.base_url, path)
    }

    fn api_key(&self) -> Option<&SecretString> {
        self.descriptor.api_key.as_ref()
    }

    fn has_api_key(&self) -> bool {
        self.api_key()
            .map(|key| !key.expose_secret().is_empty())
            .unwrap_or(false)
    }

    /// Sends the request after the limiter allows it and returns the body of a
    /// 2xx response. Every failure is flattened to a message.
    async fn send(&self, request: RequestBuilder) -> Result<String, String> {
        self.limiter.wait().await;
        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| format!("HTTP request failed: {err}"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| format!("failed to read response: {err}"))?;
        if !status.is_success() {
            return Err(format!("API returned status {}: {}", status.as_u16(), body));
        }
        trace!(source = self.name(), bytes = body.len(), "source response received");
        Ok(body)
    }

    /// Turns a lookup outcome into the result the chain sees.
    fn finish(&self, id: &TaxId, outcome: Result<EnrichmentResult, String>) -> EnrichmentResult {
        outcome.unwrap_or_else(|message| {
            warn!(source = self.name(), id = %id, error = %message, "enrichment attempt failed");
            EnrichmentResult::failure(self.name(), message)
        })
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, String> {
    serde_json::from_str(body).map_err(|err| format!("failed to parse response: {err}"))
}

/// Registration dates arrive either as epoch milliseconds or as text.
fn parse_date_value(value: Option<&Value>) -> Option<NaiveDate> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.date_naive()),
        Value::String(s) => parse_date_text(s, &["%Y-%m-%d", "%d.%m.%Y"]),
        _ => None,
    }
}

fn parse_date_text(value: &str, formats: &[&str]) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

// --- dadata -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DadataResponse {
    #[serde(default)]
    suggestions: Vec<DadataSuggestion>,
}

#[derive(Debug, Deserialize)]
struct DadataSuggestion {
    data: DadataCompany,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DadataCompany {
    inn: Option<String>,
    kpp: Option<String>,
    ogrn: Option<String>,
    okpo: Option<String>,
    okved: Option<String>,
    management: Option<DadataManagement>,
    name: DadataName,
    address: DadataAddress,
    phones: Option<Vec<DadataValue>>,
    emails: Option<Vec<DadataValue>>,
    state: DadataState,
    capital: Option<DadataAmount>,
    finance: Option<DadataFinance>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DadataManagement {
    name: Option<String>,
    post: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DadataName {
    full_with_opf: Option<String>,
    short_with_opf: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DadataAddress {
    value: Option<String>,
    unrestricted_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DadataValue {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DadataState {
    status: Option<String>,
    registration_date: Option<Value>,
    liquidation_date: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DadataAmount {
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DadataFinance {
    revenue: Option<f64>,
}

/// Russian registry lookups by INN through the party suggestions API.
pub struct DadataEnricher {
    client: SourceClient,
}

impl DadataEnricher {
    pub fn new(descriptor: EnricherDescriptor) -> AppResult<Self> {
        Ok(Self {
            client: SourceClient::new(descriptor)?,
        })
    }

    fn confidence(company: &DadataCompany) -> f64 {
        weighted_confidence(&[
            (present(&company.inn), 0.30),
            (present(&company.name.full_with_opf), 0.20),
            (present(&company.address.value), 0.15),
            (
                company
                    .management
                    .as_ref()
                    .map(|m| present(&m.name))
                    .unwrap_or(false),
                0.10,
            ),
            (
                company.phones.as_ref().map(|p| !p.is_empty()).unwrap_or(false),
                0.10,
            ),
            (present(&company.okved), 0.05),
            (present(&company.ogrn), 0.05),
            (present(&company.kpp), 0.05),
        ])
    }

    fn transform(company: DadataCompany) -> (ResolvedFields, f64) {
        let confidence = Self::confidence(&company);
        let (director, director_position) = company
            .management
            .map(|m| (non_empty(m.name), non_empty(m.post)))
            .unwrap_or((None, None));
        let fields = ResolvedFields {
            inn: non_empty(company.inn),
            kpp: non_empty(company.kpp),
            ogrn: non_empty(company.ogrn),
            okpo: non_empty(company.okpo),
            okved: non_empty(company.okved),
            full_name: non_empty(company.name.full_with_opf),
            short_name: non_empty(company.name.short_with_opf),
            legal_address: non_empty(company.address.value),
            actual_address: non_empty(company.address.unrestricted_value),
            director,
            director_position,
            phone: company
                .phones
                .and_then(|p| p.into_iter().next())
                .and_then(|p| non_empty(Some(p.value))),
            email: company
                .emails
                .and_then(|e| e.into_iter().next())
                .and_then(|e| non_empty(Some(e.value))),
            status: non_empty(company.state.status),
            registration_date: parse_date_value(company.state.registration_date.as_ref()),
            liquidation_date: parse_date_value(company.state.liquidation_date.as_ref()),
            capital: company.capital.and_then(|c| c.value),
            revenue: company.finance.and_then(|f| f.revenue),
            ..ResolvedFields::default()
        };
        (fields, confidence)
    }

    async fn lookup(&self, id: &TaxId) -> Result<EnrichmentResult, String> {
        #[derive(serde::Serialize)]
        struct RequestBody<'a> {
            query: &'a str,
            count: u8,
        }

        let mut request = self
            .client
            .http
            .post(self.client.url("/suggestions/api/4_1/rs/suggest/party"))
            .json(&RequestBody {
                query: id.as_str(),
                count: 1,
            });
        if let Some(key) = self.client.api_key() {
            request = request.header("Authorization", format!("Token {}", key.expose_secret()));
        }
        if let Some(secret) = &self.client.descriptor.secret_key {
            request = request.header("X-Secret", secret.expose_secret());
        }

        let body = self.client.send(request).await?;
        let parsed: DadataResponse = decode(&body)?;
        let company = parsed
            .suggestions
            .into_iter()
            .next()
            .map(|s| s.data)
            .ok_or_else(|| "no suggestions found".to_string())?;
        let (fields, confidence) = Self::transform(company);
        Ok(EnrichmentResult::success(self.name(), fields, confidence).with_raw_payload(body))
    }
}

#[async_trait]
impl Enricher for DadataEnricher {
    fn name(&self) -> &str {
        self.client.name()
    }

    fn priority(&self) -> i32 {
        self.client.descriptor.priority
    }

    fn supports(&self, id: &TaxId) -> bool {
        id.is_inn()
    }

    fn is_available(&self) -> bool {
        self.client.descriptor.enabled && self.client.has_api_key()
    }

    async fn enrich(&self, id: &TaxId) -> EnrichmentResult {
        self.client.finish(id, self.lookup(id).await)
    }
}

// --- adata ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AdataResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<AdataCompany>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AdataCompany {
    bin: Option<String>,
    name: Option<String>,
    register_date: Option<String>,
    oked_code: Option<String>,
    krp_code: Option<String>,
    director: Option<String>,
    legal_address: AdataAddress,
    fact_address: AdataAddress,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AdataAddress {
    address: Option<String>,
}

/// Kazakh registry lookups by BIN.
pub struct AdataEnricher {
    client: SourceClient,
}

impl AdataEnricher {
    pub fn new(descriptor: EnricherDescriptor) -> AppResult<Self> {
        Ok(Self {
            client: SourceClient::new(descriptor)?,
        })
    }

    fn confidence(company: &AdataCompany) -> f64 {
        weighted_confidence(&[
            (present(&company.bin), 0.30),
            (present(&company.name), 0.20),
            (present(&company.legal_address.address), 0.15),
            (present(&company.director), 0.10),
            (present(&company.oked_code), 0.10),
            (present(&company.register_date), 0.05),
            (present(&company.fact_address.address), 0.05),
            (present(&company.krp_code), 0.05),
        ])
    }

    fn transform(company: AdataCompany) -> (ResolvedFields, f64) {
        let confidence = Self::confidence(&company);
        let fields = ResolvedFields {
            bin: non_empty(company.bin),
            full_name: non_empty(company.name),
            director: non_empty(company.director),
            okved: non_empty(company.oked_code),
            legal_address: non_empty(company.legal_address.address),
            actual_address: non_empty(company.fact_address.address),
            registration_date: company
                .register_date
                .as_deref()
                .and_then(|d| parse_date_text(d, &["%d.%m.%Y", "%Y-%m-%d"])),
            ..ResolvedFields::default()
        };
        (fields, confidence)
    }

    async fn lookup(&self, id: &TaxId) -> Result<EnrichmentResult, String> {
        let mut request = self
            .client
            .http
            .get(self.client.url("/api/v2/company"))
            .query(&[("bin", id.as_str())]);
        if let Some(key) = self.client.api_key() {
            request = request.bearer_auth(key.expose_secret());
        }

        let body = self.client.send(request).await?;
        let parsed: AdataResponse = decode(&body)?;
        if !parsed.success {
            return Err(parsed
                .error
                .unwrap_or_else(|| "source reported failure".to_string()));
        }
        let company = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| "no company found".to_string())?;
        let (fields, confidence) = Self::transform(company);
        Ok(EnrichmentResult::success(self.name(), fields, confidence).with_raw_payload(body))
    }
}

#[async_trait]
impl Enricher for AdataEnricher {
    fn name(&self) -> &str {
        self.client.name()
    }

    fn priority(&self) -> i32 {
        self.client.descriptor.priority
    }

    fn supports(&self, id: &TaxId) -> bool {
        id.is_bin()
    }

    fn is_available(&self) -> bool {
        self.client.descriptor.enabled && self.client.has_api_key()
    }

    async fn enrich(&self, id: &TaxId) -> EnrichmentResult {
        self.client.finish(id, self.lookup(id).await)
    }
}

// --- gisp -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GispResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<GispCompany>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GispCompany {
    inn: Option<String>,
    kpp: Option<String>,
    ogrn: Option<String>,
    name: Option<String>,
    legal_address: Option<String>,
    actual_address: Option<String>,
    director: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    okved: Option<String>,
    registration_date: Option<String>,
    status: Option<String>,
}

/// Fallback Russian source. Works without credentials when a base URL is set.
pub struct GispEnricher {
    client: SourceClient,
}

impl GispEnricher {
    pub fn new(descriptor: EnricherDescriptor) -> AppResult<Self> {
        Ok(Self {
            client: SourceClient::new(descriptor)?,
        })
    }

    fn confidence(company: &GispCompany) -> f64 {
        weighted_confidence(&[
            (present(&company.inn), 0.30),
            (present(&company.name), 0.20),
            (present(&company.legal_address), 0.15),
            (present(&company.director), 0.10),
            (present(&company.phone), 0.10),
            (present(&company.okved), 0.05),
            (present(&company.ogrn), 0.05),
            (present(&company.kpp), 0.05),
        ])
    }

    fn transform(company: GispCompany) -> (ResolvedFields, f64) {
        let confidence = Self::confidence(&company);
        let fields = ResolvedFields {
            inn: non_empty(company.inn),
            kpp: non_empty(company.kpp),
            ogrn: non_empty(company.ogrn),
            full_name: non_empty(company.name),
            legal_address: non_empty(company.legal_address),
            actual_address: non_empty(company.actual_address),
            director: non_empty(company.director),
            phone: non_empty(company.phone),
            email: non_empty(company.email),
            okved: non_empty(company.okved),
            status: non_empty(company.status),
            registration_date: company
                .registration_date
                .as_deref()
                .and_then(|d| parse_date_text(d, &["%Y-%m-%d"])),
            ..ResolvedFields::default()
        };
        (fields, confidence)
    }

    async fn lookup(&self, id: &TaxId) -> Result<EnrichmentResult, String> {
        let mut request = self
            .client
            .http
            .get(self.client.url("/api/v1/company"))
            .query(&[("inn", id.as_str())]);
        if let Some(key) = self.client.api_key() {
            request = request.bearer_auth(key.expose_secret());
        }

        let body = self.client.send(request).await?;
        let parsed: GispResponse = decode(&body)?;
        let company = match parsed.data {
            Some(company) if parsed.success => company,
            _ => {
                return Err(parsed
                    .error
                    .unwrap_or_else(|| "source reported failure".to_string()))
            }
        };
        let (fields, confidence) = Self::transform(company);
        Ok(EnrichmentResult::success(self.name(), fields, confidence).with_raw_payload(body))
    }
}

#[async_trait]
impl Enricher for GispEnricher {
    fn name(&self) -> &str {
        self.client.name()
    }

    fn priority(&self) -> i32 {
        self.client.descriptor.priority
    }

    fn supports(&self, id: &TaxId) -> bool {
        id.is_inn()
    }

    fn is_available(&self) -> bool {
        self.client.descriptor.enabled && !self.client.descriptor.base_url.is_empty()
    }

    async fn enrich(&self, id: &TaxId) -> EnrichmentResult {
        self.client.finish(id, self.lookup(id).await)
    }
}
