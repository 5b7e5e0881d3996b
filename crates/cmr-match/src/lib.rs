//! Identifier normalization, per-run matcher indexes, and the confidence
//! acceptance policy.
//!
//! All matchers here follow the same shape: an immutable index built once per
//! run from the catalog snapshot, then read-only lookups that can run from any
//! number of tasks. Batch matching against an index is record-for-record
//! identical to matching each input on its own.

use std::collections::HashMap;
use std::sync::Arc;

use cmr_core::{EntityType, MatchResult, MatchStrategy, Product, TaxonomyNode};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "cmr-match";

/// Default acceptance threshold for a candidate match.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

const CONFIDENCE_EXACT: f64 = 1.0;
const CONFIDENCE_GTIN_VARIANT: f64 = 0.95;
const CONFIDENCE_PARTIAL_PATH: f64 = 0.85;
const CONFIDENCE_ALIAS: f64 = 0.8;
const CONFIDENCE_SKU_FALLBACK: f64 = 0.8;
const CONFIDENCE_NAME: f64 = 0.75;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("empty identifier")]
    EmptyIdentifier,
    #[error("unparseable url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

// ---------------------------------------------------------------------------
// GTIN normalization + check digit
// ---------------------------------------------------------------------------

/// Strip everything that is not a digit. Inputs with fewer than 8 digits are
/// rejected; anything longer passes through untouched, so the function is
/// idempotent.
pub fn normalize_gtin(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 {
        return None;
    }
    Some(digits)
}

/// GS1 mod-10 check: weights alternate 3/1 starting at the digit next to the
/// check digit. Only the four standard lengths are valid.
pub fn gtin_check_digit_valid(digits: &str) -> bool {
    if !matches!(digits.len(), 8 | 12 | 13 | 14) {
        return false;
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let values: Vec<u32> = digits.chars().map(|c| c.to_digit(10).unwrap_or(0)).collect();
    let check = values[values.len() - 1];
    let sum: u32 = values[..values.len() - 1]
        .iter()
        .rev()
        .enumerate()
        .map(|(i, v)| if i % 2 == 0 { v * 3 } else { *v })
        .sum();
    (10 - sum % 10) % 10 == check
}

/// Alternate encodings of a normalized GTIN that catalogs commonly disagree
/// on: leading zeros present or absent, GTIN-14 zero padding, and the UPC-A
/// form of an EAN-13. The input itself is never in the result.
pub fn gtin_variants(normalized: &str) -> Vec<String> {
    let mut variants = Vec::new();
    let stripped = normalized.trim_start_matches('0');
    if !stripped.is_empty() && stripped.len() >= 8 && stripped != normalized {
        variants.push(stripped.to_string());
    }
    if normalized.len() < 14 {
        variants.push(format!("{normalized:0>14}"));
    }
    if normalized.len() == 12 {
        variants.push(format!("0{normalized}"));
    }
    variants.sort();
    variants.dedup();
    variants.retain(|v| v != normalized);
    variants
}

// ---------------------------------------------------------------------------
// GTIN matcher
// ---------------------------------------------------------------------------

/// Read-only product lookup tables built once per run. Exact keys shadow
/// variant keys; the first product in catalog order wins a key collision.
#[derive(Debug, Default)]
pub struct GtinIndex {
    exact: HashMap<String, uuid::Uuid>,
    variants: HashMap<String, uuid::Uuid>,
    skus: HashMap<String, uuid::Uuid>,
    mpns: HashMap<String, uuid::Uuid>,
}

impl GtinIndex {
    pub fn build(products: &[Product]) -> Self {
        let mut index = Self::default();
        for product in products {
            if let Some(normalized) = product.gtin.as_deref().and_then(normalize_gtin) {
                for variant in gtin_variants(&normalized) {
                    index.variants.entry(variant).or_insert(product.id);
                }
                index.exact.entry(normalized).or_insert(product.id);
            }
            if let Some(sku) = product.sku.as_deref() {
                let key = sku.trim().to_lowercase();
                if !key.is_empty() {
                    index.skus.entry(key).or_insert(product.id);
                }
            }
            if let Some(mpn) = product.mpn.as_deref() {
                let key = mpn.trim().to_lowercase();
                if !key.is_empty() {
                    index.mpns.entry(key).or_insert(product.id);
                }
            }
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.skus.is_empty() && self.mpns.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GtinMatcher {
    index: Arc<GtinIndex>,
}

impl GtinMatcher {
    pub fn new(index: Arc<GtinIndex>) -> Self {
        Self { index }
    }

    /// Ladder: exact hit, then variant hit, then SKU/MPN fallback. A failed
    /// check digit never blocks the ladder; it is carried as metadata in
    /// `checksum_valid`, and a code too malformed to hit the exact or variant
    /// maps can only resolve through the lower-confidence SKU/MPN fallback.
    pub fn match_one(&self, raw: &str) -> Option<MatchResult> {
        if let Some(normalized) = normalize_gtin(raw) {
            let checksum_valid = Some(gtin_check_digit_valid(&normalized));

            if let Some(&id) = self.index.exact.get(&normalized) {
                debug!(identifier = raw, strategy = "gtin_exact", "gtin matched");
                return Some(product_match(
                    id,
                    CONFIDENCE_EXACT,
                    MatchStrategy::GtinExact,
                    normalized,
                    checksum_valid,
                ));
            }

            if let Some(&id) = self.index.variants.get(&normalized) {
                debug!(identifier = raw, strategy = "gtin_variant", "gtin matched");
                return Some(product_match(
                    id,
                    CONFIDENCE_GTIN_VARIANT,
                    MatchStrategy::GtinVariant,
                    normalized,
                    checksum_valid,
                ));
            }
            for variant in gtin_variants(&normalized) {
                let hit = self
                    .index
                    .exact
                    .get(&variant)
                    .or_else(|| self.index.variants.get(&variant));
                if let Some(&id) = hit {
                    debug!(identifier = raw, strategy = "gtin_variant", "gtin matched");
                    return Some(product_match(
                        id,
                        CONFIDENCE_GTIN_VARIANT,
                        MatchStrategy::GtinVariant,
                        variant,
                        checksum_valid,
                    ));
                }
            }
        }

        // Codes the normalizer rejects can still be a literal SKU or MPN.
        let key = raw.trim().to_lowercase();
        if !key.is_empty() {
            let hit = self.index.skus.get(&key).or_else(|| self.index.mpns.get(&key));
            if let Some(&id) = hit {
                debug!(identifier = raw, strategy = "sku_fallback", "gtin matched");
                return Some(product_match(
                    id,
                    CONFIDENCE_SKU_FALLBACK,
                    MatchStrategy::SkuFallback,
                    key,
                    None,
                ));
            }
        }

        debug!(identifier = raw, "gtin unmatched");
        None
    }

    pub fn match_batch<'a, I>(&self, raws: I) -> Vec<Option<MatchResult>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        raws.into_iter().map(|raw| self.match_one(raw)).collect()
    }
}

fn product_match(
    id: uuid::Uuid,
    confidence: f64,
    strategy: MatchStrategy,
    normalized: String,
    checksum_valid: Option<bool>,
) -> MatchResult {
    MatchResult {
        entity_type: EntityType::Product,
        entity_id: id,
        confidence,
        strategy,
        normalized,
        node_path: None,
        checksum_valid,
    }
}

// ---------------------------------------------------------------------------
// URL / path normalization
// ---------------------------------------------------------------------------

/// Canonical comparable form of a URL or bare path: scheme and host stripped,
/// lowercase, query string and fragment dropped, no surrounding slashes.
pub fn normalize_url_path(raw: &str) -> Result<String, MatchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MatchError::EmptyIdentifier);
    }
    let path = if trimmed.contains("://") {
        Url::parse(trimmed)?.path().to_string()
    } else {
        trimmed.to_string()
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    Ok(path.to_lowercase().trim_matches('/').to_string())
}

/// Comparable slug for titles, aliases, and breadcrumb segments: lowercase
/// with every run of non-alphanumerics collapsed to one hyphen.
pub fn slugify(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------------------
// URL matcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct NodeEntry {
    id: uuid::Uuid,
    path: String,
    depth: usize,
    segments: Vec<String>,
}

/// Per-run taxonomy/product lookup tables for URL and breadcrumb matching.
/// Containment candidates come from a first-segment index instead of a scan
/// over every node; the selection policy is unaffected.
#[derive(Debug, Default)]
pub struct UrlIndex {
    nodes: Vec<NodeEntry>,
    by_path: HashMap<String, usize>,
    by_first_segment: HashMap<String, Vec<usize>>,
    by_title_slug: HashMap<String, Vec<usize>>,
    by_alias_slug: HashMap<String, Vec<usize>>,
    products_by_url: HashMap<String, uuid::Uuid>,
}

impl UrlIndex {
    pub fn build(nodes: &[TaxonomyNode], products: &[Product]) -> Self {
        let mut index = Self::default();
        for node in nodes {
            let path = node.path.trim_matches('/').to_lowercase();
            if path.is_empty() {
                continue;
            }
            let segments: Vec<String> = path.split('/').map(str::to_string).collect();
            let entry_idx = index.nodes.len();
            index.by_path.entry(path.clone()).or_insert(entry_idx);
            if let Some(first) = segments.first() {
                index
                    .by_first_segment
                    .entry(first.clone())
                    .or_default()
                    .push(entry_idx);
            }
            let title_slug = slugify(&node.title);
            if !title_slug.is_empty() {
                index.by_title_slug.entry(title_slug).or_default().push(entry_idx);
            }
            for alias in &node.aliases {
                let alias_slug = slugify(alias);
                if !alias_slug.is_empty() {
                    index.by_alias_slug.entry(alias_slug).or_default().push(entry_idx);
                }
            }
            index.nodes.push(NodeEntry {
                id: node.id,
                depth: segments.len(),
                segments,
                path,
            });
        }
        for product in products {
            if let Ok(normalized) = normalize_url_path(&product.url) {
                if !normalized.is_empty() {
                    index.products_by_url.entry(normalized).or_insert(product.id);
                }
            }
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.products_by_url.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct UrlMatcher {
    index: Arc<UrlIndex>,
}

impl UrlMatcher {
    pub fn new(index: Arc<UrlIndex>) -> Self {
        Self { index }
    }

    /// Full ladder: exact path equality against a node path or product URL,
    /// then the weaker containment/alias/name strategies.
    pub fn match_url(&self, raw: &str) -> Result<Option<MatchResult>, MatchError> {
        let normalized = normalize_url_path(raw)?;
        if normalized.is_empty() {
            return Err(MatchError::EmptyIdentifier);
        }

        if let Some(&idx) = self.index.by_path.get(&normalized) {
            let entry = &self.index.nodes[idx];
            debug!(identifier = raw, strategy = "exact_path", "url matched");
            return Ok(Some(node_match(
                entry,
                CONFIDENCE_EXACT,
                MatchStrategy::ExactPath,
                normalized,
            )));
        }
        if let Some(&id) = self.index.products_by_url.get(&normalized) {
            debug!(identifier = raw, strategy = "exact_path", "url matched product");
            return Ok(Some(MatchResult {
                entity_type: EntityType::Product,
                entity_id: id,
                confidence: CONFIDENCE_EXACT,
                strategy: MatchStrategy::ExactPath,
                normalized,
                node_path: None,
                checksum_valid: None,
            }));
        }

        Ok(self.match_weak(&normalized))
    }

    pub fn match_batch<'a, I>(&self, raws: I) -> Vec<Result<Option<MatchResult>, MatchError>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        raws.into_iter().map(|raw| self.match_url(raw)).collect()
    }

    /// Strategies below exact equality, shared with the breadcrumb matcher:
    /// hierarchical containment (deepest node wins, equal depths break to the
    /// lexicographically smaller path), alias equality, title equality on the
    /// last segment. Candidates are ranked through the confidence comparator.
    pub fn match_weak(&self, normalized: &str) -> Option<MatchResult> {
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return None;
        }

        let mut candidates: Vec<MatchResult> = Vec::new();

        let mut contained: Option<&NodeEntry> = None;
        let mut seen: Vec<usize> = Vec::new();
        for segment in &segments {
            let Some(indices) = self.index.by_first_segment.get(*segment) else {
                continue;
            };
            for &idx in indices {
                if seen.contains(&idx) {
                    continue;
                }
                seen.push(idx);
                let entry = &self.index.nodes[idx];
                if !contains_contiguous(&segments, &entry.segments) {
                    continue;
                }
                let better = match contained {
                    None => true,
                    Some(best) => {
                        entry.depth > best.depth
                            || (entry.depth == best.depth && entry.path < best.path)
                    }
                };
                if better {
                    contained = Some(entry);
                }
            }
        }
        if let Some(entry) = contained {
            candidates.push(node_match(
                entry,
                CONFIDENCE_PARTIAL_PATH,
                MatchStrategy::PartialPath,
                normalized.to_string(),
            ));
        }

        let last_slug = slugify(segments[segments.len() - 1]);
        if let Some(entry) = self.smallest_path(self.index.by_alias_slug.get(&last_slug)) {
            candidates.push(node_match(
                entry,
                CONFIDENCE_ALIAS,
                MatchStrategy::AliasMatch,
                normalized.to_string(),
            ));
        }
        if let Some(entry) = self.smallest_path(self.index.by_title_slug.get(&last_slug)) {
            candidates.push(node_match(
                entry,
                CONFIDENCE_NAME,
                MatchStrategy::NameMatch,
                normalized.to_string(),
            ));
        }

        let best = ConfidencePolicy::select_best(candidates);
        match &best {
            Some(result) => debug!(
                identifier = normalized,
                strategy = result.strategy.as_str(),
                confidence = result.confidence,
                "url matched"
            ),
            None => debug!(identifier = normalized, "url unmatched"),
        }
        best
    }

    fn smallest_path(&self, indices: Option<&Vec<usize>>) -> Option<&NodeEntry> {
        indices?
            .iter()
            .map(|&idx| &self.index.nodes[idx])
            .min_by(|a, b| a.path.cmp(&b.path))
    }
}

fn node_match(
    entry: &NodeEntry,
    confidence: f64,
    strategy: MatchStrategy,
    normalized: String,
) -> MatchResult {
    MatchResult {
        entity_type: EntityType::Node,
        entity_id: entry.id,
        confidence,
        strategy,
        normalized,
        node_path: Some(entry.path.clone()),
        checksum_valid: None,
    }
}

fn contains_contiguous(haystack: &[&str], needle: &[String]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.iter().zip(needle).all(|(a, b)| *a == b))
}

// ---------------------------------------------------------------------------
// Breadcrumb matcher
// ---------------------------------------------------------------------------

/// Delimiters a human-authored breadcrumb may use, tested in priority order.
pub const BREADCRUMB_DELIMITERS: [&str; 7] = [" > ", " / ", " | ", "::", "/", ">", "|"];

/// Split a breadcrumb like "Outdoor > Jackets > Winter" into slug segments.
pub fn parse_breadcrumb(raw: &str) -> Vec<String> {
    let delimiter = BREADCRUMB_DELIMITERS
        .iter()
        .find(|delim| raw.contains(*delim));
    let segments: Vec<&str> = match delimiter {
        Some(delim) => raw.split(delim).collect(),
        None => vec![raw],
    };
    segments
        .into_iter()
        .map(slugify)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Convenience wrapper over the URL matcher: parse the breadcrumb, rejoin
/// with `/`, and run the below-exact strategies against the taxonomy.
#[derive(Debug, Clone)]
pub struct CategoryPathMatcher {
    url_matcher: UrlMatcher,
}

impl CategoryPathMatcher {
    pub fn new(index: Arc<UrlIndex>) -> Self {
        Self {
            url_matcher: UrlMatcher::new(index),
        }
    }

    pub fn match_breadcrumb(&self, raw: &str) -> Option<MatchResult> {
        let segments = parse_breadcrumb(raw);
        if segments.is_empty() {
            return None;
        }
        self.url_matcher.match_weak(&segments.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Confidence policy
// ---------------------------------------------------------------------------

/// Stateless acceptance/ranking policy shared by every matcher and by the
/// pipeline's accept-or-route-unmatched decision.
#[derive(Debug, Clone, Copy)]
pub struct ConfidencePolicy {
    pub threshold: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl ConfidencePolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn meets_threshold(&self, confidence: f64) -> bool {
        confidence >= self.threshold
    }

    /// Fixed precedence used to break confidence ties between strategies.
    pub fn strategy_rank(strategy: MatchStrategy) -> u8 {
        match strategy {
            MatchStrategy::ExactPath | MatchStrategy::GtinExact => 3,
            MatchStrategy::AliasMatch | MatchStrategy::GtinVariant => 2,
            MatchStrategy::PartialPath | MatchStrategy::SkuFallback => 1,
            MatchStrategy::NameMatch => 0,
        }
    }

    pub fn compare(a: &MatchResult, b: &MatchResult) -> std::cmp::Ordering {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| Self::strategy_rank(a.strategy).cmp(&Self::strategy_rank(b.strategy)))
    }

    /// Highest confidence wins; ties prefer the more specific strategy.
    pub fn select_best(candidates: Vec<MatchResult>) -> Option<MatchResult> {
        candidates
            .into_iter()
            .reduce(|best, next| match Self::compare(&next, &best) {
                std::cmp::Ordering::Greater => next,
                _ => best,
            })
    }
}

// ---------------------------------------------------------------------------
// Weighted mean
// ---------------------------------------------------------------------------

/// Counts-weighted average accumulator. Rollups must recompute averages from
/// carried weights, never average already-aggregated averages; when every
/// contribution has zero weight this degrades to the plain mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedMean {
    weighted_sum: f64,
    total_weight: f64,
    plain_sum: f64,
    samples: u64,
}

impl WeightedMean {
    pub fn push(&mut self, value: f64, weight: f64) {
        self.weighted_sum += value * weight;
        self.total_weight += weight;
        self.plain_sum += value;
        self.samples += 1;
    }

    pub fn push_opt(&mut self, value: Option<f64>, weight: f64) {
        if let Some(value) = value {
            self.push(value, weight);
        }
    }

    pub fn value(&self) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }
        if self.total_weight > 0.0 {
            Some(self.weighted_sum / self.total_weight)
        } else {
            Some(self.plain_sum / self.samples as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node(path: &str, title: &str, aliases: &[&str]) -> TaxonomyNode {
        TaxonomyNode {
            id: Uuid::new_v4(),
            path: path.to_string(),
            title: title.to_string(),
            depth: path.split('/').filter(|s| !s.is_empty()).count(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn product(url: &str, gtin: Option<&str>, sku: Option<&str>) -> Product {
        Product {
            id: Uuid::new_v4(),
            url: url.to_string(),
            gtin: gtin.map(str::to_string),
            sku: sku.map(str::to_string),
            mpn: None,
            category_path: None,
        }
    }

    #[test]
    fn normalize_gtin_is_idempotent() {
        let once = normalize_gtin(" 400-6381 333931 ").unwrap();
        let twice = normalize_gtin(&once).unwrap();
        assert_eq!(once, "4006381333931");
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_gtin_rejects_short_inputs() {
        assert_eq!(normalize_gtin("1234567"), None);
        assert_eq!(normalize_gtin("WJ-001"), None);
    }

    #[test]
    fn check_digit_accepts_valid_and_rejects_flipped() {
        assert!(gtin_check_digit_valid("4006381333931"));
        assert!(gtin_check_digit_valid("96385074"));
        assert!(gtin_check_digit_valid("036000291452"));
        assert!(!gtin_check_digit_valid("4006381333932"));
        assert!(!gtin_check_digit_valid("96385075"));
        assert!(!gtin_check_digit_valid("400638133"));
    }

    #[test]
    fn exact_gtin_matches_with_full_confidence() {
        let products = vec![product("/p/a", Some("4006381333931"), None)];
        let matcher = GtinMatcher::new(Arc::new(GtinIndex::build(&products)));
        let result = matcher.match_one("4006381333931").unwrap();
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.strategy, MatchStrategy::GtinExact);
        assert_eq!(result.entity_id, products[0].id);
        assert_eq!(result.checksum_valid, Some(true));
    }

    #[test]
    fn upc_a_input_matches_ean_13_catalog_entry() {
        let products = vec![product("/p/a", Some("0036000291452"), None)];
        let matcher = GtinMatcher::new(Arc::new(GtinIndex::build(&products)));
        let result = matcher.match_one("036000291452").unwrap();
        assert_eq!(result.strategy, MatchStrategy::GtinVariant);
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn sku_fallback_is_case_insensitive() {
        let products = vec![product("/p/a", None, Some("WJ-001"))];
        let matcher = GtinMatcher::new(Arc::new(GtinIndex::build(&products)));
        let result = matcher.match_one("wj-001").unwrap();
        assert_eq!(result.strategy, MatchStrategy::SkuFallback);
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.checksum_valid, None);
    }

    #[test]
    fn invalid_check_digit_still_matches_exact_entry() {
        // Catalog carries the same malformed code; the verdict is metadata.
        let products = vec![product("/p/a", Some("4006381333932"), None)];
        let matcher = GtinMatcher::new(Arc::new(GtinIndex::build(&products)));
        let result = matcher.match_one("4006381333932").unwrap();
        assert_eq!(result.strategy, MatchStrategy::GtinExact);
        assert_eq!(result.checksum_valid, Some(false));
    }

    #[test]
    fn batch_matching_is_order_independent() {
        let products = vec![
            product("/p/a", Some("4006381333931"), Some("WJ-001")),
            product("/p/b", Some("036000291452"), None),
        ];
        let matcher = GtinMatcher::new(Arc::new(GtinIndex::build(&products)));
        let inputs = ["4006381333931", "wj-001", "036000291452", "000000000000"];

        let batch = matcher.match_batch(inputs.iter().copied());
        let singles: Vec<_> = inputs.iter().map(|raw| matcher.match_one(raw)).collect();
        assert_eq!(batch, singles);

        let reversed = matcher.match_batch(inputs.iter().rev().copied());
        let expected: Vec<_> = singles.into_iter().rev().collect();
        assert_eq!(reversed, expected);
    }

    #[test]
    fn url_normalization_strips_host_query_and_case() {
        assert_eq!(
            normalize_url_path("https://shop.example.com/products/Winter-Jackets/?ref=promo#top")
                .unwrap(),
            "products/winter-jackets"
        );
        assert_eq!(
            normalize_url_path("/Products/Boots/").unwrap(),
            "products/boots"
        );
        assert!(matches!(
            normalize_url_path("   "),
            Err(MatchError::EmptyIdentifier)
        ));
    }

    #[test]
    fn exact_path_beats_everything() {
        let nodes = vec![node("products/winter-jackets", "Winter Jackets", &[])];
        let index = Arc::new(UrlIndex::build(&nodes, &[]));
        let matcher = UrlMatcher::new(index);
        let result = matcher
            .match_url("https://shop.example.com/products/Winter-Jackets/")
            .unwrap()
            .unwrap();
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.strategy, MatchStrategy::ExactPath);
        assert_eq!(result.node_path.as_deref(), Some("products/winter-jackets"));
    }

    #[test]
    fn containment_prefers_deepest_node() {
        let nodes = vec![
            node("jackets", "Jackets", &[]),
            node("jackets/winter", "Winter", &[]),
        ];
        let deep_id = nodes[1].id;
        let matcher = UrlMatcher::new(Arc::new(UrlIndex::build(&nodes, &[])));
        let result = matcher
            .match_url("/products/jackets/winter/red")
            .unwrap()
            .unwrap();
        assert_eq!(result.entity_id, deep_id);
        assert_eq!(result.strategy, MatchStrategy::PartialPath);
        assert_eq!(result.confidence, 0.85);
    }

    #[test]
    fn equal_depth_containment_breaks_ties_lexicographically() {
        let nodes = vec![node("winter", "Winter", &[]), node("red", "Red", &[])];
        let red_id = nodes[1].id;
        let matcher = UrlMatcher::new(Arc::new(UrlIndex::build(&nodes, &[])));
        let result = matcher.match_url("/sale/red/winter").unwrap().unwrap();
        assert_eq!(result.entity_id, red_id);
    }

    #[test]
    fn alias_outranks_title_on_the_last_segment() {
        let nodes = vec![
            node("outdoor/parkas", "Parkas", &[]),
            node("outdoor/jackets", "Jackets", &["parkas"]),
        ];
        let alias_id = nodes[1].id;
        let matcher = UrlMatcher::new(Arc::new(UrlIndex::build(&nodes, &[])));
        let result = matcher.match_url("/shop/parkas").unwrap().unwrap();
        assert_eq!(result.entity_id, alias_id);
        assert_eq!(result.strategy, MatchStrategy::AliasMatch);
        assert_eq!(result.confidence, 0.8);
    }

    #[test]
    fn title_match_is_the_weakest_strategy() {
        let nodes = vec![node("outdoor/jackets", "Rain Gear", &[])];
        let matcher = UrlMatcher::new(Arc::new(UrlIndex::build(&nodes, &[])));
        let result = matcher.match_url("/shop/Rain-Gear").unwrap().unwrap();
        assert_eq!(result.strategy, MatchStrategy::NameMatch);
        assert_eq!(result.confidence, 0.75);
    }

    #[test]
    fn product_url_matches_exactly() {
        let products = vec![product("/products/boots/trail-boot", None, None)];
        let pid = products[0].id;
        let matcher = UrlMatcher::new(Arc::new(UrlIndex::build(&[], &products)));
        let result = matcher
            .match_url("https://shop.example.com/products/boots/trail-boot?utm=x")
            .unwrap()
            .unwrap();
        assert_eq!(result.entity_type, EntityType::Product);
        assert_eq!(result.entity_id, pid);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn breadcrumb_delimiters_are_detected_in_priority_order() {
        assert_eq!(
            parse_breadcrumb("Outdoor > Jackets > Winter"),
            vec!["outdoor", "jackets", "winter"]
        );
        assert_eq!(parse_breadcrumb("Outdoor/Jackets"), vec!["outdoor", "jackets"]);
        assert_eq!(parse_breadcrumb("Outdoor::Jackets"), vec!["outdoor", "jackets"]);
        assert_eq!(parse_breadcrumb("Home | Sale"), vec!["home", "sale"]);
        assert_eq!(parse_breadcrumb("Jackets"), vec!["jackets"]);
    }

    #[test]
    fn breadcrumb_delegates_to_containment() {
        let nodes = vec![
            node("outdoor", "Outdoor", &[]),
            node("outdoor/jackets", "Jackets", &[]),
        ];
        let deep_id = nodes[1].id;
        let matcher = CategoryPathMatcher::new(Arc::new(UrlIndex::build(&nodes, &[])));
        let result = matcher.match_breadcrumb("Outdoor > Jackets").unwrap();
        assert_eq!(result.entity_id, deep_id);
        assert_eq!(result.strategy, MatchStrategy::PartialPath);
    }

    #[test]
    fn policy_threshold_and_tie_break() {
        let policy = ConfidencePolicy::default();
        assert!(policy.meets_threshold(0.7));
        assert!(!policy.meets_threshold(0.69));

        let id = Uuid::new_v4();
        let mk = |confidence: f64, strategy: MatchStrategy| MatchResult {
            entity_type: EntityType::Node,
            entity_id: id,
            confidence,
            strategy,
            normalized: String::new(),
            node_path: None,
            checksum_valid: None,
        };
        // Equal confidence: the more specific strategy wins.
        let best = ConfidencePolicy::select_best(vec![
            mk(0.8, MatchStrategy::SkuFallback),
            mk(0.8, MatchStrategy::AliasMatch),
        ])
        .unwrap();
        assert_eq!(best.strategy, MatchStrategy::AliasMatch);
        // Higher confidence wins regardless of rank.
        let best = ConfidencePolicy::select_best(vec![
            mk(0.85, MatchStrategy::PartialPath),
            mk(0.8, MatchStrategy::AliasMatch),
        ])
        .unwrap();
        assert_eq!(best.strategy, MatchStrategy::PartialPath);
        assert_eq!(ConfidencePolicy::select_best(vec![]), None);
    }

    #[test]
    fn weighted_mean_uses_weights_and_degrades_to_plain_mean() {
        let mut mean = WeightedMean::default();
        mean.push(4.0, 100.0);
        mean.push(8.0, 300.0);
        assert_eq!(mean.value(), Some(7.0));

        let mut zero = WeightedMean::default();
        zero.push(4.0, 0.0);
        zero.push(8.0, 0.0);
        assert_eq!(zero.value(), Some(6.0));

        assert_eq!(WeightedMean::default().value(), None);
    }
}
