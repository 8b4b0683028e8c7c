//! Measurement extractor contracts + HTML extractors for the weather archive sites.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use wxsync_core::{City, RawMeasurementSet, RawSample};
use wxsync_storage::{FetchError, HttpFetcher, PageArchive};

pub const CRATE_NAME: &str = "wxsync-adapters";

pub const SINOPTIK: &str = "sinoptik";
pub const METEOPOST: &str = "meteopost";

#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("{source_id} has no data for {date}")]
    NotFound { source_id: String, date: NaiveDate },
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("unparsable page: {0}")]
    Parse(String),
}

impl ExtractError {
    pub fn not_found(source_id: &str, date: NaiveDate) -> Self {
        ExtractError::NotFound {
            source_id: source_id.to_string(),
            date,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ExtractError::NotFound { .. })
    }

    fn from_fetch(source_id: &str, date: NaiveDate, err: FetchError) -> Self {
        if err.is_not_found() {
            ExtractError::not_found(source_id, date)
        } else {
            ExtractError::Transient(err.to_string())
        }
    }
}

/// Opaque per-date source of raw samples.
#[async_trait]
pub trait MeasurementExtractor: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, city: &City, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError>;
}

/// HTML layout of a source site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    Sinoptik,
    Meteopost,
}

impl PageFormat {
    pub fn for_source(source_id: &str) -> Option<Self> {
        match source_id {
            SINOPTIK => Some(PageFormat::Sinoptik),
            METEOPOST => Some(PageFormat::Meteopost),
            _ => None,
        }
    }

    pub fn parse(self, html: &str, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError> {
        match self {
            PageFormat::Sinoptik => parse_sinoptik_page(html, date),
            PageFormat::Meteopost => parse_meteopost_page(html, date),
        }
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Parse(e.to_string()))
}

fn cell_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .map(|n| n.text().collect::<String>().trim().to_string())
        .collect())
}

/// Accepts `H:mm`, `HH:mm` and the spaced `H :mm` variant.
pub fn parse_clock(text: &str) -> Option<NaiveTime> {
    let compact = text.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    let (h, m) = compact.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

/// Accepts `+5°`, `-3°`, `0°` and the unicode minus sign.
pub fn parse_degrees(text: &str) -> Option<i32> {
    let cleaned = text
        .trim()
        .trim_end_matches(|c: char| c == '°' || c == 'C' || c.is_whitespace())
        .replace('\u{2212}', "-");
    cleaned.parse().ok()
}

/// Sinoptik day page: `table.weatherDetails` with a time row and a temperature row.
/// A page without the table means the site has no data for the date.
pub fn parse_sinoptik_page(html: &str, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table.weatherDetails")?;
    let Some(table) = document.select(&table_sel).next() else {
        return Err(ExtractError::not_found(SINOPTIK, date));
    };

    let times = cell_texts(table, "tbody > tr.gray.time > td")?;
    let temperatures = cell_texts(table, "tbody > tr.temperature > td")?;
    if times.len() != temperatures.len() {
        return Err(ExtractError::Parse(format!(
            "sinoptik {date}: {} time cells vs {} temperature cells",
            times.len(),
            temperatures.len()
        )));
    }

    let samples = times
        .iter()
        .zip(&temperatures)
        .map(|(time, temp)| {
            let time = parse_clock(time)
                .ok_or_else(|| ExtractError::Parse(format!("sinoptik {date}: bad time {time:?}")))?;
            let temperature = parse_degrees(temp).ok_or_else(|| {
                ExtractError::Parse(format!("sinoptik {date}: bad temperature {temp:?}"))
            })?;
            Ok(RawSample::new(time, temperature))
        })
        .collect::<Result<Vec<_>, ExtractError>>()?;

    Ok(RawMeasurementSet::new(date, samples))
}

/// Meteopost archive page: `#arc` table, first column time, second temperature.
/// Rows that do not parse (missing readings) are skipped.
pub fn parse_meteopost_page(html: &str, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError> {
    let document = Html::parse_document(html);
    let table_sel = selector("#arc")?;
    let Some(table) = document.select(&table_sel).next() else {
        return Err(ExtractError::not_found(METEOPOST, date));
    };

    let times = cell_texts(table, "tbody td:nth-child(1)")?;
    let temperatures = cell_texts(table, "tbody td:nth-child(2)")?;
    let samples = times
        .iter()
        .zip(&temperatures)
        .filter_map(|(time, temp)| Some(RawSample::new(parse_clock(time)?, parse_degrees(temp)?)))
        .collect::<Vec<_>>();

    if samples.len() < times.len() {
        debug!(%date, skipped = times.len() - samples.len(), "meteopost rows without readings");
    }
    Ok(RawMeasurementSet::new(date, samples))
}

async fn archive_page(archive: Option<&PageArchive>, source_id: &str, date: NaiveDate, body: &[u8]) {
    let Some(archive) = archive else {
        return;
    };
    if let Err(err) = archive.store_page(source_id, date, "html", body).await {
        warn!(source_id, %date, error = %err, "failed to archive raw page");
    }
}

/// Live sinoptik extractor: `GET <base>/<city keyword>/<yyyy-mm-dd>`.
#[derive(Debug, Clone)]
pub struct SinoptikExtractor {
    http: Arc<HttpFetcher>,
    base_url: String,
    archive: Option<PageArchive>,
}

impl SinoptikExtractor {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn day_url(&self, city: &City, date: NaiveDate) -> Result<Url, ExtractError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ExtractError::Transient(format!("invalid sinoptik base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ExtractError::Transient("sinoptik base url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(&city.keyword)
            .push(&date.format("%Y-%m-%d").to_string());
        Ok(url)
    }
}

#[async_trait]
impl MeasurementExtractor for SinoptikExtractor {
    fn source_id(&self) -> &str {
        SINOPTIK
    }

    async fn fetch(&self, city: &City, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError> {
        let url = self.day_url(city, date)?;
        info!(%city, %date, "collecting daily temperature");
        let response = self
            .http
            .get_bytes(SINOPTIK, url.as_str())
            .await
            .map_err(|e| ExtractError::from_fetch(SINOPTIK, date, e))?;
        archive_page(self.archive.as_ref(), SINOPTIK, date, &response.body).await;
        parse_sinoptik_page(&String::from_utf8_lossy(&response.body), date)
    }
}

/// Live meteopost extractor: archive form POST with day, month, year and station.
#[derive(Debug, Clone)]
pub struct MeteopostExtractor {
    http: Arc<HttpFetcher>,
    base_url: String,
    archive: Option<PageArchive>,
}

impl MeteopostExtractor {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn archive_form(station: &str, date: NaiveDate) -> Vec<(&'static str, String)> {
        vec![
            ("d", date.day().to_string()),
            ("m", format!("{:02}", date.month())),
            ("y", date.year().to_string()),
            ("city", station.to_string()),
            ("arc", "1".to_string()),
        ]
    }
}

#[async_trait]
impl MeasurementExtractor for MeteopostExtractor {
    fn source_id(&self) -> &str {
        METEOPOST
    }

    async fn fetch(&self, city: &City, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError> {
        let Some(station) = city.meteopost_station.as_deref() else {
            return Err(ExtractError::not_found(METEOPOST, date));
        };
        info!(%city, %date, "collecting daily temperature");
        let form = Self::archive_form(station, date);
        let response = self
            .http
            .post_form_bytes(METEOPOST, &self.base_url, &form)
            .await
            .map_err(|e| ExtractError::from_fetch(METEOPOST, date, e))?;
        archive_page(self.archive.as_ref(), METEOPOST, date, &response.body).await;
        parse_meteopost_page(&String::from_utf8_lossy(&response.body), date)
    }
}

/// Offline extractor serving `<root>/<yyyy-mm-dd>.html` through a site parser.
#[derive(Debug, Clone)]
pub struct FixtureExtractor {
    source_id: String,
    root: PathBuf,
    format: PageFormat,
}

impl FixtureExtractor {
    pub fn new(source_id: impl Into<String>, root: impl Into<PathBuf>, format: PageFormat) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
            format,
        }
    }

    pub fn page_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!("{}.html", date.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl MeasurementExtractor for FixtureExtractor {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, _city: &City, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError> {
        let path = self.page_path(date);
        let html = match tokio::fs::read_to_string(&path).await {
            Ok(html) => html,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExtractError::not_found(&self.source_id, date));
            }
            Err(err) => {
                return Err(ExtractError::Transient(format!(
                    "reading fixture {}: {err}",
                    path.display()
                )))
            }
        };
        self.format.parse(&html, date)
    }
}

/// Dates a source covers; `to` is inclusive, `None` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageWindow {
    pub from: NaiveDate,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl CoverageWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && self.to.map_or(true, |to| date <= to)
    }
}

/// Delegates each date to the first extractor whose window covers it.
#[derive(Clone, Default)]
pub struct DateWindowRouter {
    routes: Vec<(CoverageWindow, Arc<dyn MeasurementExtractor>)>,
}

impl DateWindowRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, window: CoverageWindow, extractor: Arc<dyn MeasurementExtractor>) -> Self {
        self.routes.push((window, extractor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn extractor_for(&self, date: NaiveDate) -> Option<&Arc<dyn MeasurementExtractor>> {
        self.routes
            .iter()
            .find(|(window, _)| window.contains(date))
            .map(|(_, extractor)| extractor)
    }
}

#[async_trait]
impl MeasurementExtractor for DateWindowRouter {
    fn source_id(&self) -> &str {
        "router"
    }

    async fn fetch(&self, city: &City, date: NaiveDate) -> Result<RawMeasurementSet, ExtractError> {
        match self.extractor_for(date) {
            Some(extractor) => extractor.fetch(city, date).await,
            None => Err(ExtractError::not_found("router", date)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Live,
    Fixture,
}

pub fn extractor_for_source(
    source_id: &str,
    mode: SourceMode,
    base_url: &str,
    http: &Arc<HttpFetcher>,
    archive: Option<PageArchive>,
    fixtures_root: &Path,
) -> Option<Arc<dyn MeasurementExtractor>> {
    let format = PageFormat::for_source(source_id)?;
    match (mode, format) {
        (SourceMode::Fixture, format) => Some(Arc::new(FixtureExtractor::new(
            source_id,
            fixtures_root.join(source_id),
            format,
        ))),
        (SourceMode::Live, PageFormat::Sinoptik) => Some(Arc::new(
            SinoptikExtractor::new(Arc::clone(http), base_url).with_archive(archive),
        )),
        (SourceMode::Live, PageFormat::Meteopost) => Some(Arc::new(
            MeteopostExtractor::new(Arc::clone(http), base_url).with_archive(archive),
        )),
    }
}
