//! Raw-payload artifact storage, HTTP fetch utilities, and the persistence
//! contracts the pipeline writes through.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use cmr_core::{CatalogSnapshot, IntegratedMetric, TenantId, UnmatchedMetric};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmr-storage";

// ---------------------------------------------------------------------------
// Artifact store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed store for the raw payload each collector
/// returned, kept so a matching decision can always be traced back to its
/// input bytes.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        date: NaiveDate,
        tenant: &TenantId,
        source: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(date.format("%Y-%m-%d").to_string())
            .join(tenant.as_str())
            .join(format!("{source}-{content_hash}.json"))
    }

    /// Store bytes immutably via a temp file and atomic rename; an existing
    /// file at the hash path means the identical payload was already stored.
    pub async fn store_payload(
        &self,
        date: NaiveDate,
        tenant: &TenantId,
        source: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(date, tenant, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("artifact path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-concurrency GET client with capped exponential retry. One global
/// limit plus a lazily created per-collector limit.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Persistence contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored data: {0}")]
    Decode(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

pub async fn connect_pool(database_url: &str) -> Result<PgPool, RepoError> {
    Ok(PgPool::connect(database_url).await?)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), RepoError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Read-only view over the tenant's catalog. The catalog is authored by the
/// out-of-scope CRUD tooling; a run only ever takes a snapshot of it.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn load(&self, tenant: &TenantId) -> Result<CatalogSnapshot, RepoError>;
}

/// Write-side contract for a run. `upsert_integrated` is a single
/// transactional batch, idempotent on the row key; `record_unmatched` is
/// insert-or-increment on `(tenant, source, identifier)`.
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn upsert_integrated(
        &self,
        tenant: &TenantId,
        date: NaiveDate,
        rows: &[IntegratedMetric],
    ) -> Result<(), RepoError>;

    async fn record_unmatched(&self, row: &UnmatchedMetric) -> Result<(), RepoError>;

    async fn integrated_count(&self, tenant: &TenantId, date: NaiveDate)
        -> Result<u64, RepoError>;
}

// ---------------------------------------------------------------------------
// Postgres implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgCatalogProvider {
    pool: PgPool,
}

impl PgCatalogProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogProvider for PgCatalogProvider {
    async fn load(&self, tenant: &TenantId) -> Result<CatalogSnapshot, RepoError> {
        let node_rows = sqlx::query(
            r#"
            SELECT id, path, title, depth, aliases
              FROM taxonomy_nodes
             WHERE tenant_id = $1
             ORDER BY path
            "#,
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut nodes = Vec::with_capacity(node_rows.len());
        for row in node_rows {
            let aliases: serde_json::Value = row.try_get("aliases")?;
            let aliases = aliases
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            nodes.push(cmr_core::TaxonomyNode {
                id: row.try_get("id")?,
                path: row.try_get("path")?,
                title: row.try_get("title")?,
                depth: row.try_get::<i32, _>("depth")? as usize,
                aliases,
            });
        }

        let product_rows = sqlx::query(
            r#"
            SELECT id, url, gtin, sku, mpn, category_path
              FROM products
             WHERE tenant_id = $1
             ORDER BY id
            "#,
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut products = Vec::with_capacity(product_rows.len());
        for row in product_rows {
            products.push(cmr_core::Product {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                gtin: row.try_get("gtin")?,
                sku: row.try_get("sku")?,
                mpn: row.try_get("mpn")?,
                category_path: row.try_get("category_path")?,
            });
        }

        Ok(CatalogSnapshot { nodes, products })
    }
}

#[derive(Debug, Clone)]
pub struct PgMetricsRepository {
    pool: PgPool,
}

impl PgMetricsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsRepository for PgMetricsRepository {
    async fn upsert_integrated(
        &self,
        tenant: &TenantId,
        date: NaiveDate,
        rows: &[IntegratedMetric],
    ) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO integrated_metrics (
                    tenant_id, entity_type, entity_id, metrics_date,
                    clicks, impressions, position,
                    sessions, revenue, transactions, engagement_rate,
                    market_clicks, market_impressions, conversions, conversion_rate,
                    gsc_match_confidence, ga_match_confidence, market_match_confidence,
                    is_aggregated, child_count, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                        $12, $13, $14, $15, $16, $17, $18, $19, $20, now())
                ON CONFLICT (tenant_id, entity_type, entity_id, metrics_date)
                DO UPDATE SET
                    clicks = EXCLUDED.clicks,
                    impressions = EXCLUDED.impressions,
                    position = EXCLUDED.position,
                    sessions = EXCLUDED.sessions,
                    revenue = EXCLUDED.revenue,
                    transactions = EXCLUDED.transactions,
                    engagement_rate = EXCLUDED.engagement_rate,
                    market_clicks = EXCLUDED.market_clicks,
                    market_impressions = EXCLUDED.market_impressions,
                    conversions = EXCLUDED.conversions,
                    conversion_rate = EXCLUDED.conversion_rate,
                    gsc_match_confidence = EXCLUDED.gsc_match_confidence,
                    ga_match_confidence = EXCLUDED.ga_match_confidence,
                    market_match_confidence = EXCLUDED.market_match_confidence,
                    is_aggregated = EXCLUDED.is_aggregated,
                    child_count = EXCLUDED.child_count,
                    updated_at = now()
                "#,
            )
            .bind(tenant.as_str())
            .bind(row.entity_type.as_str())
            .bind(row.entity_id)
            .bind(date)
            .bind(row.clicks.map(|v| v as i64))
            .bind(row.impressions.map(|v| v as i64))
            .bind(row.position)
            .bind(row.sessions.map(|v| v as i64))
            .bind(row.revenue)
            .bind(row.transactions.map(|v| v as i64))
            .bind(row.engagement_rate)
            .bind(row.market_clicks.map(|v| v as i64))
            .bind(row.market_impressions.map(|v| v as i64))
            .bind(row.conversions.map(|v| v as i64))
            .bind(row.conversion_rate)
            .bind(row.gsc_match_confidence)
            .bind(row.ga_match_confidence)
            .bind(row.market_match_confidence)
            .bind(row.is_aggregated)
            .bind(row.child_count as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_unmatched(&self, row: &UnmatchedMetric) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO unmatched_metrics (
                tenant_id, source, identifier, identifier_type,
                payload, resolved, match_attempts, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, FALSE, 1, now())
            ON CONFLICT (tenant_id, source, identifier)
            DO UPDATE SET
                match_attempts = unmatched_metrics.match_attempts + 1,
                payload = EXCLUDED.payload,
                last_seen_at = now()
            "#,
        )
        .bind(row.tenant_id.as_str())
        .bind(row.source.as_str())
        .bind(&row.identifier)
        .bind(row.identifier_type.as_str())
        .bind(&row.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn integrated_count(
        &self,
        tenant: &TenantId,
        date: NaiveDate,
    ) -> Result<u64, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
              FROM integrated_metrics
             WHERE tenant_id = $1 AND metrics_date = $2
            "#,
        )
        .bind(tenant.as_str())
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// Catalog snapshot held in memory; the test/fixture counterpart of the
/// Postgres provider.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalogProvider {
    snapshot: CatalogSnapshot,
}

impl MemoryCatalogProvider {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl CatalogProvider for MemoryCatalogProvider {
    async fn load(&self, _tenant: &TenantId) -> Result<CatalogSnapshot, RepoError> {
        Ok(self.snapshot.clone())
    }
}

type IntegratedKey = (String, String, Uuid, NaiveDate);
type UnmatchedKey = (String, String, String);

/// Map-backed repository with the same key semantics as the Postgres one.
/// `failing()` builds an instance whose batch upsert always errors, for
/// exercising the fatal persistence path.
#[derive(Debug, Default)]
pub struct MemoryMetricsRepository {
    integrated: Mutex<HashMap<IntegratedKey, IntegratedMetric>>,
    unmatched: Mutex<HashMap<UnmatchedKey, UnmatchedMetric>>,
    fail_upserts: bool,
}

impl MemoryMetricsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_upserts: true,
            ..Self::default()
        }
    }

    pub async fn integrated_rows(&self, tenant: &TenantId, date: NaiveDate) -> Vec<IntegratedMetric> {
        self.integrated
            .lock()
            .await
            .values()
            .filter(|row| row.tenant_id == *tenant && row.metrics_date == date)
            .cloned()
            .collect()
    }

    pub async fn unmatched_rows(&self, tenant: &TenantId) -> Vec<UnmatchedMetric> {
        self.unmatched
            .lock()
            .await
            .values()
            .filter(|row| row.tenant_id == *tenant)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetricsRepository for MemoryMetricsRepository {
    async fn upsert_integrated(
        &self,
        tenant: &TenantId,
        date: NaiveDate,
        rows: &[IntegratedMetric],
    ) -> Result<(), RepoError> {
        if self.fail_upserts {
            return Err(RepoError::Unavailable("upserts disabled".to_string()));
        }
        let mut map = self.integrated.lock().await;
        for row in rows {
            let key = (
                tenant.as_str().to_string(),
                row.entity_type.as_str().to_string(),
                row.entity_id,
                date,
            );
            map.insert(key, row.clone());
        }
        Ok(())
    }

    async fn record_unmatched(&self, row: &UnmatchedMetric) -> Result<(), RepoError> {
        let mut map = self.unmatched.lock().await;
        let key = (
            row.tenant_id.as_str().to_string(),
            row.source.as_str().to_string(),
            row.identifier.clone(),
        );
        map.entry(key)
            .and_modify(|existing| {
                existing.match_attempts += 1;
                existing.payload = row.payload.clone();
            })
            .or_insert_with(|| row.clone());
        Ok(())
    }

    async fn integrated_count(
        &self,
        tenant: &TenantId,
        date: NaiveDate,
    ) -> Result<u64, RepoError> {
        Ok(self.integrated_rows(tenant, date).await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmr_core::{EntityType, IdentifierType, MetricSource};
    use tempfile::tempdir;

    fn demo_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).expect("date")
    }

    #[test]
    fn payload_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let tenant = TenantId::new("demo-tenant");

        let first = store
            .store_payload(demo_date(), &tenant, "search", br#"{"rows":[]}"#)
            .await
            .expect("first store");
        let second = store
            .store_payload(demo_date(), &tenant, "search", br#"{"rows":[]}"#)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn memory_upsert_is_idempotent_on_the_row_key() {
        let repo = MemoryMetricsRepository::new();
        let tenant = TenantId::new("demo-tenant");
        let mut row = IntegratedMetric::empty(
            tenant.clone(),
            EntityType::Product,
            Uuid::new_v4(),
            demo_date(),
        );
        row.clicks = Some(5);

        repo.upsert_integrated(&tenant, demo_date(), std::slice::from_ref(&row))
            .await
            .expect("first upsert");
        row.clicks = Some(9);
        repo.upsert_integrated(&tenant, demo_date(), std::slice::from_ref(&row))
            .await
            .expect("second upsert");

        assert_eq!(repo.integrated_count(&tenant, demo_date()).await.unwrap(), 1);
        let rows = repo.integrated_rows(&tenant, demo_date()).await;
        assert_eq!(rows[0].clicks, Some(9));
    }

    #[tokio::test]
    async fn unmatched_conflict_increments_attempts() {
        let repo = MemoryMetricsRepository::new();
        let tenant = TenantId::new("demo-tenant");
        let row = UnmatchedMetric {
            tenant_id: tenant.clone(),
            source: MetricSource::Market,
            identifier: "012345678905".to_string(),
            identifier_type: IdentifierType::Gtin,
            payload: serde_json::json!({"gtin": "012345678905"}),
            resolved: false,
            match_attempts: 1,
        };

        repo.record_unmatched(&row).await.expect("first");
        repo.record_unmatched(&row).await.expect("second");

        let rows = repo.unmatched_rows(&tenant).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].match_attempts, 2);
        assert!(!rows[0].resolved);
    }

    #[tokio::test]
    async fn failing_repository_rejects_batch_upserts() {
        let repo = MemoryMetricsRepository::failing();
        let tenant = TenantId::new("demo-tenant");
        let err = repo
            .upsert_integrated(&tenant, demo_date(), &[])
            .await
            .expect_err("should fail");
        assert!(matches!(err, RepoError::Unavailable(_)));
    }
}
