//! Core domain model for CMR: catalog entities, raw source metrics,
//! integrated rows, and run results.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmr-core";

/// Tenant scope for a reconciliation run. Every catalog lookup and every
/// persisted row carries it; nothing in this workspace matches across tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three external collectors a run reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    Search,
    Analytics,
    Market,
}

impl MetricSource {
    pub const ALL: [MetricSource; 3] = [
        MetricSource::Search,
        MetricSource::Analytics,
        MetricSource::Market,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricSource::Search => "search",
            MetricSource::Analytics => "analytics",
            MetricSource::Market => "market",
        }
    }
}

impl std::fmt::Display for MetricSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of catalog entity a metric resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Node,
    Product,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Node => "node",
            EntityType::Product => "product",
        }
    }
}

/// Shape of the low-trust identifier an external record arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Url,
    Gtin,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Url => "url",
            IdentifierType::Gtin => "gtin",
        }
    }
}

/// A category in the tenant's taxonomy. `path` is the slash-joined chain of
/// lowercase ancestor slugs ("outdoor/jackets/winter") and uniquely identifies
/// the node within a tenant; the parent is the node owning the path minus its
/// last segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: Uuid,
    pub path: String,
    pub title: String,
    pub depth: usize,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl TaxonomyNode {
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Path of the parent node, or None for roots.
    pub fn parent_path(&self) -> Option<String> {
        let segments = self.segments();
        if segments.len() <= 1 {
            return None;
        }
        Some(segments[..segments.len() - 1].join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub url: String,
    #[serde(default)]
    pub gtin: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub mpn: Option<String>,
    #[serde(default)]
    pub category_path: Option<String>,
}

/// Per-run, read-only view of the tenant's catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub nodes: Vec<TaxonomyNode>,
    pub products: Vec<Product>,
}

/// Strategy that produced a match candidate, from most to least specific
/// within its matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExactPath,
    PartialPath,
    NameMatch,
    AliasMatch,
    GtinExact,
    GtinVariant,
    SkuFallback,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::ExactPath => "exact_path",
            MatchStrategy::PartialPath => "partial_path",
            MatchStrategy::NameMatch => "name_match",
            MatchStrategy::AliasMatch => "alias_match",
            MatchStrategy::GtinExact => "gtin_exact",
            MatchStrategy::GtinVariant => "gtin_variant",
            MatchStrategy::SkuFallback => "sku_fallback",
        }
    }
}

/// A resolved candidate for one external identifier. Confidence is a [0,1]
/// float everywhere in this workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub confidence: f64,
    pub strategy: MatchStrategy,
    /// Canonical form of the identifier the strategies compared against.
    pub normalized: String,
    /// Path of the matched node, when the entity is a node.
    #[serde(default)]
    pub node_path: Option<String>,
    /// Check-digit verdict for GTIN inputs; None for URL/path matches.
    #[serde(default)]
    pub checksum_valid: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMetric {
    pub url: String,
    pub date: NaiveDate,
    pub clicks: u64,
    pub impressions: u64,
    #[serde(default)]
    pub position: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsMetric {
    pub page_path: String,
    pub date: NaiveDate,
    pub sessions: u64,
    pub revenue: f64,
    pub transactions: u64,
    #[serde(default)]
    pub engagement_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketMetric {
    pub gtin: String,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
}

/// One raw row fetched from a collector, tagged by source so downstream code
/// can handle each shape exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RawMetricRecord {
    Search(SearchMetric),
    Analytics(AnalyticsMetric),
    Market(MarketMetric),
}

impl RawMetricRecord {
    pub fn source(&self) -> MetricSource {
        match self {
            RawMetricRecord::Search(_) => MetricSource::Search,
            RawMetricRecord::Analytics(_) => MetricSource::Analytics,
            RawMetricRecord::Market(_) => MetricSource::Market,
        }
    }

    /// The low-trust identifier the record arrived keyed by.
    pub fn identifier(&self) -> &str {
        match self {
            RawMetricRecord::Search(m) => &m.url,
            RawMetricRecord::Analytics(m) => &m.page_path,
            RawMetricRecord::Market(m) => &m.gtin,
        }
    }

    pub fn identifier_type(&self) -> IdentifierType {
        match self {
            RawMetricRecord::Search(_) | RawMetricRecord::Analytics(_) => IdentifierType::Url,
            RawMetricRecord::Market(_) => IdentifierType::Gtin,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            RawMetricRecord::Search(m) => m.date,
            RawMetricRecord::Analytics(m) => m.date,
            RawMetricRecord::Market(m) => m.date,
        }
    }
}

/// Merged per-entity summary for one reporting date. The
/// `(tenant_id, entity_type, entity_id, metrics_date)` tuple is globally
/// unique; re-running a date overwrites the prior row for the same key.
/// Numeric fields are optional because an absent source contributes nothing,
/// which is not the same as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratedMetric {
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub metrics_date: NaiveDate,
    pub clicks: Option<u64>,
    pub impressions: Option<u64>,
    pub position: Option<f64>,
    pub sessions: Option<u64>,
    pub revenue: Option<f64>,
    pub transactions: Option<u64>,
    pub engagement_rate: Option<f64>,
    pub market_clicks: Option<u64>,
    pub market_impressions: Option<u64>,
    pub conversions: Option<u64>,
    pub conversion_rate: Option<f64>,
    pub gsc_match_confidence: Option<f64>,
    pub ga_match_confidence: Option<f64>,
    pub market_match_confidence: Option<f64>,
    pub is_aggregated: bool,
    pub child_count: u32,
}

impl IntegratedMetric {
    /// Empty row for a key; all metric fields unset.
    pub fn empty(
        tenant_id: TenantId,
        entity_type: EntityType,
        entity_id: Uuid,
        metrics_date: NaiveDate,
    ) -> Self {
        Self {
            tenant_id,
            entity_type,
            entity_id,
            metrics_date,
            clicks: None,
            impressions: None,
            position: None,
            sessions: None,
            revenue: None,
            transactions: None,
            engagement_rate: None,
            market_clicks: None,
            market_impressions: None,
            conversions: None,
            conversion_rate: None,
            gsc_match_confidence: None,
            ga_match_confidence: None,
            market_match_confidence: None,
            is_aggregated: false,
            child_count: 0,
        }
    }
}

/// An identifier no strategy could resolve above the acceptance threshold.
/// Rows persist across runs so a reviewer can supply a manual mapping;
/// `match_attempts` counts the runs that re-encountered the identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedMetric {
    pub tenant_id: TenantId,
    pub source: MetricSource,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub payload: serde_json::Value,
    pub resolved: bool,
    pub match_attempts: u32,
}

/// Phase of a reconciliation run; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    LoadingCatalog,
    FetchingSources,
    Matching,
    Combining,
    Aggregating,
    Persisting,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::LoadingCatalog => "loading_catalog",
            RunPhase::FetchingSources => "fetching_sources",
            RunPhase::Matching => "matching",
            RunPhase::Combining => "combining",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Persisting => "persisting",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_processed: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub aggregated: usize,
    pub avg_confidence: f64,
}

/// What a run hands back to its caller. The orchestrator never lets an error
/// escape past this; callers inspect `success` and `errors` and decide
/// whether to retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub tenant_id: TenantId,
    pub metrics_date: NaiveDate,
    pub success: bool,
    pub phase: RunPhase,
    pub stats: RunStats,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str) -> TaxonomyNode {
        TaxonomyNode {
            id: Uuid::new_v4(),
            path: path.to_string(),
            title: path.to_string(),
            depth: path.split('/').filter(|s| !s.is_empty()).count(),
            aliases: vec![],
        }
    }

    #[test]
    fn parent_path_strips_last_segment() {
        assert_eq!(
            node("outdoor/jackets/winter").parent_path().as_deref(),
            Some("outdoor/jackets")
        );
        assert_eq!(node("outdoor").parent_path(), None);
    }

    #[test]
    fn raw_record_identifier_follows_source() {
        let record = RawMetricRecord::Market(MarketMetric {
            gtin: "4006381333931".into(),
            date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            impressions: 10,
            clicks: 2,
            conversions: 1,
        });
        assert_eq!(record.identifier(), "4006381333931");
        assert_eq!(record.identifier_type(), IdentifierType::Gtin);
        assert_eq!(record.source().as_str(), "market");
    }
}
