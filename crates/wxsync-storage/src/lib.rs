//! Measurement stores, raw page archive and HTTP fetch utilities.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use wxsync_core::{DateRange, TemperatureRecord};

pub const CRATE_NAME: &str = "wxsync-storage";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("record serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let unavailable = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        );
        if unavailable {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}

/// Source of the dates already present in a store.
#[async_trait]
pub trait KnownDatesStore: Send + Sync {
    /// Distinct calendar dates in ascending order, optionally limited to `range`.
    async fn list_dates_sorted(&self, range: Option<DateRange>) -> Result<Vec<NaiveDate>, StoreError>;
}

/// Store that reconciled records are written to and maintained in.
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Upsert by record id. One call is one atomic store operation.
    async fn bulk_write(&self, records: &[TemperatureRecord]) -> Result<(), StoreError>;

    async fn bulk_delete(&self, records: &[TemperatureRecord]) -> Result<(), StoreError>;

    /// All records ordered by timestamp; ties keep the store's arrival order.
    async fn find_all_sorted_by_date(&self) -> Result<Vec<TemperatureRecord>, StoreError>;

    /// Records dated inside `range`, in `find_all_sorted_by_date` order.
    async fn find_in_range(&self, range: DateRange) -> Result<Vec<TemperatureRecord>, StoreError> {
        let mut records = self.find_all_sorted_by_date().await?;
        records.retain(|r| range.contains(r.date()));
        Ok(records)
    }

    async fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError>;
}

/// A store that plays both roles.
pub trait MeasurementStore: Send + Sync {
    fn as_known_dates(&self) -> &dyn KnownDatesStore;
    fn as_target(&self) -> &dyn TargetStore;
}

impl<T: KnownDatesStore + TargetStore + 'static> MeasurementStore for T {
    fn as_known_dates(&self) -> &dyn KnownDatesStore {
        self
    }

    fn as_target(&self) -> &dyn TargetStore {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    Document,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Relational => "relational",
            StoreKind::Document => "document",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "rdbms" | "jdbc" => Ok(StoreKind::Relational),
            "document" | "mongo" => Ok(StoreKind::Document),
            other => Err(anyhow::anyhow!("unknown store kind {other}")),
        }
    }
}

/// Process-local store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TemperatureRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<TemperatureRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub async fn snapshot(&self) -> Vec<TemperatureRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl KnownDatesStore for MemoryStore {
    async fn list_dates_sorted(&self, range: Option<DateRange>) -> Result<Vec<NaiveDate>, StoreError> {
        let records = self.records.lock().await;
        let mut dates = records
            .iter()
            .map(TemperatureRecord::date)
            .filter(|d| range.map_or(true, |r| r.contains(*d)))
            .collect::<Vec<_>>();
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn bulk_write(&self, records: &[TemperatureRecord]) -> Result<(), StoreError> {
        let mut stored = self.records.lock().await;
        for record in records {
            match stored.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => stored.push(record.clone()),
            }
        }
        Ok(())
    }

    async fn bulk_delete(&self, records: &[TemperatureRecord]) -> Result<(), StoreError> {
        let mut stored = self.records.lock().await;
        stored.retain(|r| !records.iter().any(|d| d.id == r.id));
        Ok(())
    }

    async fn find_all_sorted_by_date(&self) -> Result<Vec<TemperatureRecord>, StoreError> {
        let mut records = self.records.lock().await.clone();
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        Ok(self.records.lock().await.iter().map(TemperatureRecord::date).max())
    }
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("connecting to database: {e}")))
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying migrations")?;
    Ok(())
}

/// Relational store: one row per record in `daily_temperature`.
#[derive(Debug, Clone)]
pub struct PgRelationalStore {
    pool: PgPool,
}

impl PgRelationalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KnownDatesStore for PgRelationalStore {
    async fn list_dates_sorted(&self, range: Option<DateRange>) -> Result<Vec<NaiveDate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT recorded_at::date AS measured_on
              FROM daily_temperature
             WHERE ($1::date IS NULL OR recorded_at::date >= $1)
               AND ($2::date IS NULL OR recorded_at::date <= $2)
             ORDER BY measured_on
            "#,
        )
        .bind(range.map(|r| r.start))
        .bind(range.map(|r| r.end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<NaiveDate, _>("measured_on").map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl TargetStore for PgRelationalStore {
    fn name(&self) -> &str {
        "relational"
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn bulk_write(&self, records: &[TemperatureRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO daily_temperature (id, recorded_at, morning, afternoon, evening, night) ",
        );
        qb.push_values(records, |mut b, r| {
            b.push_bind(r.id)
                .push_bind(r.recorded_at)
                .push_bind(r.morning)
                .push_bind(r.afternoon)
                .push_bind(r.evening)
                .push_bind(r.night);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET recorded_at = EXCLUDED.recorded_at, \
             morning = EXCLUDED.morning, afternoon = EXCLUDED.afternoon, \
             evening = EXCLUDED.evening, night = EXCLUDED.night",
        );
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn bulk_delete(&self, records: &[TemperatureRecord]) -> Result<(), StoreError> {
        let ids = records.iter().map(|r| r.id).collect::<Vec<Uuid>>();
        sqlx::query("DELETE FROM daily_temperature WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_all_sorted_by_date(&self) -> Result<Vec<TemperatureRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, recorded_at, morning, afternoon, evening, night
              FROM daily_temperature
             ORDER BY recorded_at, inserted_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(relational_row).collect()
    }

    async fn find_in_range(&self, range: DateRange) -> Result<Vec<TemperatureRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, recorded_at, morning, afternoon, evening, night
              FROM daily_temperature
             WHERE recorded_at::date BETWEEN $1 AND $2
             ORDER BY recorded_at, inserted_at, id
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(relational_row).collect()
    }

    async fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query("SELECT MAX(recorded_at)::date AS latest FROM daily_temperature")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<NaiveDate>, _>("latest")?)
    }
}

/// Document layout of the `weather_archive` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveDocument {
    #[serde(rename = "_id")]
    id: Uuid,
    date: NaiveDateTime,
    morning_temperature: f64,
    afternoon_temperature: f64,
    evening_temperature: f64,
    night_temperature: f64,
}

impl From<&TemperatureRecord> for ArchiveDocument {
    fn from(r: &TemperatureRecord) -> Self {
        Self {
            id: r.id,
            date: r.recorded_at,
            morning_temperature: r.morning,
            afternoon_temperature: r.afternoon,
            evening_temperature: r.evening,
            night_temperature: r.night,
        }
    }
}

impl From<ArchiveDocument> for TemperatureRecord {
    fn from(d: ArchiveDocument) -> Self {
        Self {
            id: d.id,
            recorded_at: d.date,
            morning: d.morning_temperature,
            afternoon: d.afternoon_temperature,
            evening: d.evening_temperature,
            night: d.night_temperature,
        }
    }
}

/// Document store: JSON documents in `weather_archive`, indexed by timestamp.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KnownDatesStore for PgDocumentStore {
    async fn list_dates_sorted(&self, range: Option<DateRange>) -> Result<Vec<NaiveDate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT recorded_at::date AS measured_on
              FROM weather_archive
             WHERE ($1::date IS NULL OR recorded_at::date >= $1)
               AND ($2::date IS NULL OR recorded_at::date <= $2)
             ORDER BY measured_on
            "#,
        )
        .bind(range.map(|r| r.start))
        .bind(range.map(|r| r.end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<NaiveDate, _>("measured_on").map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl TargetStore for PgDocumentStore {
    fn name(&self) -> &str {
        "document"
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn bulk_write(&self, records: &[TemperatureRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let documents = records
            .iter()
            .map(|r| {
                serde_json::to_value(ArchiveDocument::from(r))
                    .map(|doc| (r.id, r.recorded_at, doc))
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO weather_archive (id, recorded_at, document) ");
        qb.push_values(documents, |mut b, (id, recorded_at, doc)| {
            b.push_bind(id).push_bind(recorded_at).push_bind(Json(doc));
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET recorded_at = EXCLUDED.recorded_at, \
             document = EXCLUDED.document",
        );
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn bulk_delete(&self, records: &[TemperatureRecord]) -> Result<(), StoreError> {
        let ids = records.iter().map(|r| r.id).collect::<Vec<Uuid>>();
        sqlx::query("DELETE FROM weather_archive WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_all_sorted_by_date(&self) -> Result<Vec<TemperatureRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT document FROM weather_archive ORDER BY recorded_at, inserted_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(doc): Json<ArchiveDocument> = row.try_get("document")?;
            out.push(TemperatureRecord::from(doc));
        }
        Ok(out)
    }

    async fn latest_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query("SELECT MAX(recorded_at)::date AS latest FROM weather_archive")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<NaiveDate>, _>("latest")?)
    }
}

fn relational_row(row: &sqlx::postgres::PgRow) -> Result<TemperatureRecord, StoreError> {
    Ok(TemperatureRecord {
        id: row.try_get("id")?,
        recorded_at: row.try_get("recorded_at")?,
        morning: row.try_get("morning")?,
        afternoon: row.try_get("afternoon")?,
        evening: row.try_get("evening")?,
        night: row.try_get("night")?,
    })
}

pub fn open_store(kind: StoreKind, pool: PgPool) -> Arc<dyn MeasurementStore> {
    match kind {
        StoreKind::Relational => Arc::new(PgRelationalStore::new(pool)),
        StoreKind::Document => Arc::new(PgDocumentStore::new(pool)),
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of scraped source pages.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
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

    pub fn page_relative_path(
        &self,
        source_id: &str,
        date: NaiveDate,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "html" } else { ext };
        PathBuf::from(source_id)
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes under a hash-addressed path using an atomic temp-file rename.
    pub async fn store_page(
        &self,
        source_id: &str,
        date: NaiveDate,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(source_id, date, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating page directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking page path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp page file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp page {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Whether a failed request deserves another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Again,
    GiveUp,
}

impl Retry {
    /// Throttling and server-side failures are retried; everything else is final.
    pub fn for_status(status: StatusCode) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Retry::Again
        } else {
            Retry::GiveUp
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Retry::Again
        } else {
            Retry::GiveUp
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// `first_delay * 2^retry`, capped at `ceiling`.
    pub fn delay_before(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .and_then(|factor| self.first_delay.checked_mul(factor))
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }
}

/// Sustained request rate with a burst allowance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: u32,
}

impl RateLimit {
    /// `None` for a non-positive rate, which means unlimited.
    pub fn per_second(rate: f64) -> Option<Self> {
        (rate.is_finite() && rate > 0.0).then(|| Self {
            per_second: rate,
            burst: rate.ceil().max(1.0) as u32,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Allowance {
    permits: f64,
    refreshed_at: Instant,
}

impl Allowance {
    fn full(limit: RateLimit, now: Instant) -> Self {
        Self {
            permits: f64::from(limit.burst),
            refreshed_at: now,
        }
    }

    /// Takes a permit at `now`, or returns how long until one accrues.
    fn take(&mut self, limit: RateLimit, now: Instant) -> Option<Duration> {
        let accrued = now.saturating_duration_since(self.refreshed_at).as_secs_f64() * limit.per_second;
        self.permits = (self.permits + accrued).min(f64::from(limit.burst));
        self.refreshed_at = now;
        if self.permits >= 1.0 {
            self.permits -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - self.permits) / limit.per_second))
        }
    }
}

/// Spaces outgoing requests so the sites are not hit faster than `RateLimit`.
#[derive(Debug)]
pub struct RequestPacer {
    limit: RateLimit,
    allowance: Mutex<Allowance>,
}

impl RequestPacer {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            allowance: Mutex::new(Allowance::full(limit, Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = self.allowance.lock().await.take(self.limit, Instant::now());
            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
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
    #[error("http fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }
}

/// Rate-limited HTTP client shared by all extractors of a run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
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
            pacer: config.rate_limit.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(source_id, url, |client| client.get(url))
            .await
    }

    pub async fn post_form_bytes(
        &self,
        source_id: &str,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(source_id, url, |client| client.post(url).form(form))
            .await
    }

    async fn send_with_retry<F>(
        &self,
        source_id: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        let span = info_span!("http_fetch", source_id, url);
        async move {
            let mut attempt = 0usize;
            loop {
                match build(&self.client).send().await {
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

                        if Retry::for_status(status) == Retry::Again
                            && attempt < self.backoff.max_retries
                        {
                            debug!(%status, attempt, "retrying after http status");
                            tokio::time::sleep(self.backoff.delay_before(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if Retry::for_error(&err) == Retry::Again
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying after request error");
                            tokio::time::sleep(self.backoff.delay_before(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
