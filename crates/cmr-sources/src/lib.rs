//! Provider contracts and payload parsing for the three external collectors.
//!
//! Each provider fetches one source's rows for a `(tenant, date)` pair and
//! hands back tagged `RawMetricRecord`s plus the raw payload bytes for the
//! artifact store. Parsing is tolerant: numbers may arrive as JSON numbers or
//! numeric strings, row lists may sit under `rows` or `data`, and rows
//! missing their identifier are skipped and counted, never fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use cmr_core::{
    AnalyticsMetric, CatalogSnapshot, MarketMetric, MetricSource, RawMetricRecord, SearchMetric,
    TenantId,
};
use cmr_storage::{CatalogProvider, FetchError, HttpFetcher, RepoError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmr-sources";

/// Per-tenant collector coordinates, resolved from the tenant registry.
#[derive(Debug, Clone)]
pub struct TenantSourceConfig {
    pub tenant_id: TenantId,
    pub search_property: Option<String>,
    pub analytics_property: Option<String>,
    pub merchant_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Message(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One source's rows for a run, plus the payload bytes they were parsed from.
#[derive(Debug, Clone)]
pub struct FetchedMetrics {
    pub source: MetricSource,
    pub records: Vec<RawMetricRecord>,
    pub raw_payload: Option<Vec<u8>>,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    fn source(&self) -> MetricSource;

    async fn fetch(
        &self,
        run_id: Uuid,
        tenant: &TenantSourceConfig,
        date: NaiveDate,
    ) -> Result<FetchedMetrics, ProviderError>;
}

// ---------------------------------------------------------------------------
// Tolerant JSON extraction
// ---------------------------------------------------------------------------

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| json_at(value, &[key]).and_then(JsonValue::as_str))
}

/// Numbers arrive as JSON numbers or numeric strings depending on collector.
fn json_f64(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| {
        let v = json_at(value, &[key])?;
        v.as_f64().or_else(|| v.as_str()?.trim().parse().ok())
    })
}

fn json_u64(value: &JsonValue, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| {
        let v = json_at(value, &[key])?;
        v.as_u64().or_else(|| v.as_str()?.trim().parse().ok())
    })
}

/// Row list under `rows` or `data`, or the payload itself when it is already
/// an array. A payload with neither yields no rows rather than an error.
fn payload_rows(payload: &JsonValue) -> Vec<&JsonValue> {
    let list = payload
        .get("rows")
        .or_else(|| payload.get("data"))
        .or(Some(payload));
    list.and_then(JsonValue::as_array)
        .map(|arr| arr.iter().collect())
        .unwrap_or_default()
}

fn parse_payload(bytes: &[u8]) -> Result<JsonValue, ProviderError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProviderError::Message(format!("invalid payload json: {err}")))
}

pub fn parse_search_payload(
    bytes: &[u8],
    date: NaiveDate,
) -> Result<Vec<RawMetricRecord>, ProviderError> {
    let payload = parse_payload(bytes)?;
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in payload_rows(&payload) {
        let Some(url) = json_str(row, &["url", "page"]) else {
            skipped += 1;
            continue;
        };
        records.push(RawMetricRecord::Search(SearchMetric {
            url: url.to_string(),
            date,
            clicks: json_u64(row, &["clicks"]).unwrap_or(0),
            impressions: json_u64(row, &["impressions"]).unwrap_or(0),
            position: json_f64(row, &["position"]),
        }));
    }
    if skipped > 0 {
        warn!(source = "search", skipped, "rows without identifier skipped");
    }
    Ok(records)
}

pub fn parse_analytics_payload(
    bytes: &[u8],
    date: NaiveDate,
) -> Result<Vec<RawMetricRecord>, ProviderError> {
    let payload = parse_payload(bytes)?;
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in payload_rows(&payload) {
        let Some(page_path) = json_str(row, &["page_path", "pagePath", "page"]) else {
            skipped += 1;
            continue;
        };
        records.push(RawMetricRecord::Analytics(AnalyticsMetric {
            page_path: page_path.to_string(),
            date,
            sessions: json_u64(row, &["sessions"]).unwrap_or(0),
            revenue: json_f64(row, &["revenue"]).unwrap_or(0.0),
            transactions: json_u64(row, &["transactions"]).unwrap_or(0),
            engagement_rate: json_f64(row, &["engagement_rate", "engagementRate"]),
        }));
    }
    if skipped > 0 {
        warn!(source = "analytics", skipped, "rows without identifier skipped");
    }
    Ok(records)
}

pub fn parse_market_payload(
    bytes: &[u8],
    date: NaiveDate,
) -> Result<Vec<RawMetricRecord>, ProviderError> {
    let payload = parse_payload(bytes)?;
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in payload_rows(&payload) {
        let Some(gtin) = json_str(row, &["gtin", "offer_id", "offerId"]) else {
            skipped += 1;
            continue;
        };
        records.push(RawMetricRecord::Market(MarketMetric {
            gtin: gtin.to_string(),
            date,
            impressions: json_u64(row, &["impressions"]).unwrap_or(0),
            clicks: json_u64(row, &["clicks"]).unwrap_or(0),
            conversions: json_u64(row, &["conversions"]).unwrap_or(0),
        }));
    }
    if skipped > 0 {
        warn!(source = "market", skipped, "rows without identifier skipped");
    }
    Ok(records)
}

fn parse_source_payload(
    source: MetricSource,
    bytes: &[u8],
    date: NaiveDate,
) -> Result<Vec<RawMetricRecord>, ProviderError> {
    match source {
        MetricSource::Search => parse_search_payload(bytes, date),
        MetricSource::Analytics => parse_analytics_payload(bytes, date),
        MetricSource::Market => parse_market_payload(bytes, date),
    }
}

// ---------------------------------------------------------------------------
// HTTP providers
// ---------------------------------------------------------------------------

/// Provider backed by the pre-authenticated internal metrics gateway.
/// Token lifecycle for the upstream vendors lives behind that gateway, not
/// here; these are plain GETs with retry and bounded concurrency from the
/// shared fetcher.
pub struct HttpMetricsProvider {
    source: MetricSource,
    base_url: String,
    fetcher: Arc<HttpFetcher>,
}

impl HttpMetricsProvider {
    pub fn new(source: MetricSource, base_url: impl Into<String>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            source,
            base_url: base_url.into(),
            fetcher,
        }
    }

    fn request_url(
        &self,
        tenant: &TenantSourceConfig,
        date: NaiveDate,
    ) -> Result<String, ProviderError> {
        let base = self.base_url.trim_end_matches('/');
        let missing = |what: &str| {
            ProviderError::Message(format!(
                "tenant {} has no {what} configured",
                tenant.tenant_id
            ))
        };
        Ok(match self.source {
            MetricSource::Search => {
                let property = tenant.search_property.as_deref().ok_or_else(|| missing("search property"))?;
                format!("{base}/v1/search/metrics?property={property}&date={date}")
            }
            MetricSource::Analytics => {
                let property = tenant
                    .analytics_property
                    .as_deref()
                    .ok_or_else(|| missing("analytics property"))?;
                format!("{base}/v1/analytics/report?property={property}&date={date}")
            }
            MetricSource::Market => {
                let merchant = tenant.merchant_id.as_deref().ok_or_else(|| missing("merchant id"))?;
                format!("{base}/v1/market/performance?merchant={merchant}&date={date}")
            }
        })
    }
}

#[async_trait]
impl MetricsProvider for HttpMetricsProvider {
    fn source(&self) -> MetricSource {
        self.source
    }

    async fn fetch(
        &self,
        run_id: Uuid,
        tenant: &TenantSourceConfig,
        date: NaiveDate,
    ) -> Result<FetchedMetrics, ProviderError> {
        let url = self.request_url(tenant, date)?;
        let response = self
            .fetcher
            .fetch_bytes(run_id, self.source.as_str(), &url)
            .await?;
        let records = parse_source_payload(self.source, &response.body, date)?;
        Ok(FetchedMetrics {
            source: self.source,
            records,
            raw_payload: Some(response.body),
            fetched_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixture providers
// ---------------------------------------------------------------------------

/// Reads `fixtures/<tenant>/<date>/<source>.json`, with the same payload
/// shapes the gateway returns. Used by fixture-mode tenants and tests.
pub struct FixtureMetricsProvider {
    source: MetricSource,
    fixtures_root: PathBuf,
}

impl FixtureMetricsProvider {
    pub fn new(source: MetricSource, fixtures_root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            fixtures_root: fixtures_root.into(),
        }
    }

    fn payload_path(&self, tenant: &TenantId, date: NaiveDate) -> PathBuf {
        self.fixtures_root
            .join(tenant.as_str())
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{}.json", self.source.as_str()))
    }
}

#[async_trait]
impl MetricsProvider for FixtureMetricsProvider {
    fn source(&self) -> MetricSource {
        self.source
    }

    async fn fetch(
        &self,
        _run_id: Uuid,
        tenant: &TenantSourceConfig,
        date: NaiveDate,
    ) -> Result<FetchedMetrics, ProviderError> {
        let path = self.payload_path(&tenant.tenant_id, date);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading fixture payload {}", path.display()))?;
        let records = parse_source_payload(self.source, &bytes, date)?;
        Ok(FetchedMetrics {
            source: self.source,
            records,
            raw_payload: Some(bytes),
            fetched_at: Utc::now(),
        })
    }
}

/// Picks the provider implementation for a tenant's configured mode.
pub fn provider_for_source(
    mode: &str,
    source: MetricSource,
    base_url: &str,
    fetcher: Arc<HttpFetcher>,
    fixtures_root: &Path,
) -> Box<dyn MetricsProvider> {
    match mode {
        "fixture" => Box::new(FixtureMetricsProvider::new(source, fixtures_root)),
        _ => Box::new(HttpMetricsProvider::new(source, base_url, fetcher)),
    }
}

/// Catalog snapshot from `fixtures/<tenant>/catalog.json`.
pub struct FixtureCatalogProvider {
    fixtures_root: PathBuf,
}

impl FixtureCatalogProvider {
    pub fn new(fixtures_root: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_root: fixtures_root.into(),
        }
    }
}

#[async_trait]
impl CatalogProvider for FixtureCatalogProvider {
    async fn load(&self, tenant: &TenantId) -> Result<CatalogSnapshot, RepoError> {
        let path = self.fixtures_root.join(tenant.as_str()).join("catalog.json");
        let bytes = std::fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|err| RepoError::Decode(format!("{}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).expect("date")
    }

    #[test]
    fn search_parser_accepts_numbers_and_numeric_strings() {
        let payload = br#"{
            "rows": [
                {"url": "/products/a", "clicks": 5, "impressions": "120", "position": "4.2"},
                {"clicks": 9}
            ]
        }"#;
        let records = parse_search_payload(payload, demo_date()).expect("parse");
        assert_eq!(records.len(), 1);
        let RawMetricRecord::Search(metric) = &records[0] else {
            panic!("expected search record");
        };
        assert_eq!(metric.clicks, 5);
        assert_eq!(metric.impressions, 120);
        assert_eq!(metric.position, Some(4.2));
    }

    #[test]
    fn rows_may_live_under_data_or_be_the_payload_itself() {
        let under_data = br#"{"data": [{"gtin": "4006381333931", "clicks": 2}]}"#;
        let bare_array = br#"[{"gtin": "4006381333931", "clicks": 2}]"#;
        assert_eq!(parse_market_payload(under_data, demo_date()).unwrap().len(), 1);
        assert_eq!(parse_market_payload(bare_array, demo_date()).unwrap().len(), 1);
    }

    #[test]
    fn missing_rows_key_yields_no_records() {
        let records = parse_analytics_payload(br#"{"meta": {}}"#, demo_date()).expect("parse");
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_search_payload(b"not json", demo_date()).is_err());
    }

    #[test]
    fn analytics_parser_reads_alternate_key_spellings() {
        let payload = br#"{
            "rows": [
                {"pagePath": "/products/a", "sessions": 3, "engagementRate": 0.5}
            ]
        }"#;
        let records = parse_analytics_payload(payload, demo_date()).expect("parse");
        let RawMetricRecord::Analytics(metric) = &records[0] else {
            panic!("expected analytics record");
        };
        assert_eq!(metric.page_path, "/products/a");
        assert_eq!(metric.sessions, 3);
        assert_eq!(metric.engagement_rate, Some(0.5));
    }

    #[tokio::test]
    async fn fixture_provider_reads_committed_demo_payloads() {
        let fixtures_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let provider = FixtureMetricsProvider::new(MetricSource::Search, &fixtures_root);
        let tenant = TenantSourceConfig {
            tenant_id: TenantId::new("demo-tenant"),
            search_property: None,
            analytics_property: None,
            merchant_id: None,
        };
        let fetched = provider
            .fetch(Uuid::new_v4(), &tenant, demo_date())
            .await
            .expect("fixture fetch");
        assert_eq!(fetched.source, MetricSource::Search);
        assert!(!fetched.records.is_empty());
        assert!(fetched.raw_payload.is_some());
    }

    #[tokio::test]
    async fn fixture_catalog_provider_loads_snapshot() {
        let fixtures_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let provider = FixtureCatalogProvider::new(&fixtures_root);
        let snapshot = provider
            .load(&TenantId::new("demo-tenant"))
            .await
            .expect("catalog load");
        assert!(!snapshot.nodes.is_empty());
        assert!(!snapshot.products.is_empty());
    }
}
