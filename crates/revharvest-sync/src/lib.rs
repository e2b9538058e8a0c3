//! Crawl orchestration, watermarks, merge and load pipeline for revharvest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use revharvest_adapters::{
    extract_hotel_since, AdapterError, ExtractLimits, HotelExtraction, HotelTarget,
    HtmlSourceLauncher, OrderingPolicy, ReviewSource, SiteSelectors, SourceLauncher, StopReason,
};
use revharvest_core::{Outcome, RunOutput, Watermarks};
use revharvest_storage::{
    timestamped_output_path, write_json_atomic, BackoffPolicy, HttpClientConfig, RenderEndpoint,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;
pub mod store;

pub use merge::{
    discover_run_files, merge_files, merge_into, merge_run_outputs, MergeReport, MergeStats,
};
pub use store::{
    apply_canonical, collapse_batch, conflict_clause, read_canonical_file, MemoryReviewStore,
    PgReviewStore, ReviewStore, UpsertMode, UpsertReport,
};

pub const CRATE_NAME: &str = "revharvest-sync";
pub const CANONICAL_FILE_NAME: &str = "reviews_cleaned.json";
pub const DEFAULT_SEARCH_ENTRY_POINT: &str = "https://www.agoda.com/city/da-nang-vn.html";
pub const DEFAULT_MAX_HOTELS: usize = 3;
pub const DEFAULT_REVIEWS_PER_HOTEL: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub render_url: Option<String>,
    pub pacing: Duration,
    pub headless: bool,
    pub selectors_path: Option<PathBuf>,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let var_or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let database_url = var("DATABASE_URL").unwrap_or_else(|| {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                var_or("DB_USER", "admin"),
                var_or("DB_PASS", "password123"),
                var_or("DB_HOST", "localhost"),
                var_or("DB_PORT", "5432"),
                var_or("DB_NAME", "hotel_insights"),
            )
        });

        Self {
            database_url,
            data_dir: PathBuf::from(var_or("REVHARVEST_DATA_DIR", "data")),
            user_agent: var_or("REVHARVEST_USER_AGENT", "revharvest-bot/0.1"),
            http_timeout_secs: var("REVHARVEST_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            render_url: var("REVHARVEST_RENDER_URL"),
            pacing: Duration::from_millis(
                var("REVHARVEST_PACING_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2000),
            ),
            headless: var("REVHARVEST_HEADLESS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            selectors_path: var("REVHARVEST_SELECTORS").map(PathBuf::from),
        }
    }

    pub fn canonical_path(&self) -> PathBuf {
        self.data_dir.join(CANONICAL_FILE_NAME)
    }

    pub fn default_output_path(&self, now: DateTime<Utc>) -> PathBuf {
        timestamped_output_path(&self.data_dir, now)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
            render: self.render_url.as_ref().map(|base_url| RenderEndpoint {
                base_url: base_url.clone(),
                headless: self.headless,
            }),
        }
    }

    pub fn site_selectors(&self) -> Result<SiteSelectors> {
        match &self.selectors_path {
            Some(path) => SiteSelectors::from_yaml_file(path),
            None => Ok(SiteSelectors::default()),
        }
    }

    pub fn launcher(&self) -> Result<HtmlSourceLauncher> {
        Ok(HtmlSourceLauncher::new(
            self.http_client_config(),
            self.site_selectors()?,
        ))
    }
}

/// Which hotels a crawl visits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTargets {
    /// Discover hotels from a listing page.
    Search { entry_point: String },
    Single { url: String },
    List { hotels: Vec<HotelTarget> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlPlan {
    pub targets: CrawlTargets,
    pub max_hotels: usize,
    pub reviews_per_hotel: usize,
    pub output_path: PathBuf,
    pub ordering: OrderingPolicy,
}

impl CrawlPlan {
    pub fn new(targets: CrawlTargets, output_path: impl Into<PathBuf>) -> Self {
        Self {
            targets,
            max_hotels: DEFAULT_MAX_HOTELS,
            reviews_per_hotel: DEFAULT_REVIEWS_PER_HOTEL,
            output_path: output_path.into(),
            ordering: OrderingPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HotelListFile {
    hotels: Vec<HotelListEntry>,
}

#[derive(Debug, Deserialize)]
struct HotelListEntry {
    url: String,
    #[serde(default)]
    name: Option<String>,
}

/// Reads `hotels: [{url, name?}]` from a YAML file.
pub fn load_hotel_list(path: &Path) -> Result<Vec<HotelTarget>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading hotel list {}", path.display()))?;
    let file: HotelListFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing hotel list {}", path.display()))?;
    Ok(file
        .hotels
        .iter()
        .filter(|entry| !entry.url.trim().is_empty())
        .map(|entry| HotelTarget::from_url(&entry.url, entry.name.as_deref()))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HotelState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotelReport {
    pub name: String,
    pub url: String,
    pub state: HotelState,
    pub reviews: usize,
    pub skipped_reviews: usize,
    pub pages_fetched: usize,
    pub early_stop: bool,
    pub error: Option<String>,
}

impl HotelReport {
    fn pending(target: &HotelTarget) -> Self {
        Self {
            name: target.name.clone(),
            url: target.url.clone(),
            state: HotelState::Pending,
            reviews: 0,
            skipped_reviews: 0,
            pages_fetched: 0,
            early_stop: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub output_path: PathBuf,
    pub hotels: Vec<HotelReport>,
    pub hotels_completed: usize,
    pub hotels_failed: usize,
    pub reviews_collected: usize,
    pub early_stops: usize,
    pub last_checkpoint_sha256: Option<String>,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("fetch capability failed to start: {0}")]
    Launch(#[source] AdapterError),
    #[error("hotel discovery failed at {entry_point}: {source}")]
    Discovery {
        entry_point: String,
        #[source]
        source: AdapterError,
    },
    #[error("checkpoint to {} failed: {reason}", .path.display())]
    Checkpoint { path: PathBuf, reason: String },
}

/// Sequential crawl over a plan's hotels with a checkpoint after each completed hotel.
#[derive(Debug, Clone)]
pub struct CrawlOrchestrator {
    pacing: Duration,
}

impl CrawlOrchestrator {
    pub fn new(pacing: Duration) -> Self {
        Self { pacing }
    }

    /// Runs `plan` on a freshly launched source; the source is closed on every exit path.
    pub async fn run(
        &self,
        launcher: &dyn SourceLauncher,
        plan: &CrawlPlan,
        watermarks: &Watermarks,
    ) -> Result<CrawlSummary, CrawlError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, output = %plan.output_path.display(), "crawl run starting");

        let mut source = launcher.launch().await.map_err(|err| {
            error!(
                %run_id,
                severity = "critical",
                error = %err,
                "fetch capability failed to start"
            );
            CrawlError::Launch(err)
        })?;

        let result = self
            .run_with_source(&mut *source, plan, watermarks, run_id, started_at)
            .await;

        if let Err(err) = source.close().await {
            warn!(%run_id, error = %err, "closing review source failed");
        }

        match &result {
            Ok(summary) => info!(
                %run_id,
                completed = summary.hotels_completed,
                failed = summary.hotels_failed,
                reviews = summary.reviews_collected,
                early_stops = summary.early_stops,
                "crawl run finished"
            ),
            Err(err) => error!(%run_id, severity = "critical", error = %err, "crawl run aborted"),
        }
        result
    }

    async fn resolve_targets(
        &self,
        source: &mut dyn ReviewSource,
        plan: &CrawlPlan,
    ) -> Result<Vec<HotelTarget>, CrawlError> {
        let mut targets = match &plan.targets {
            CrawlTargets::Search { entry_point } => source
                .discover_hotels(entry_point, plan.max_hotels)
                .await
                .map_err(|source| CrawlError::Discovery {
                    entry_point: entry_point.clone(),
                    source,
                })?,
            CrawlTargets::Single { url } => vec![HotelTarget::from_url(url, None)],
            CrawlTargets::List { hotels } => hotels.clone(),
        };
        targets.truncate(plan.max_hotels);
        Ok(targets)
    }

    async fn run_with_source(
        &self,
        source: &mut dyn ReviewSource,
        plan: &CrawlPlan,
        watermarks: &Watermarks,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<CrawlSummary, CrawlError> {
        let targets = self.resolve_targets(source, plan).await?;
        info!(
            %run_id,
            hotels = targets.len(),
            source = source.source_id(),
            "crawl targets resolved"
        );

        let mut reports = targets.iter().map(HotelReport::pending).collect::<Vec<_>>();
        let mut output: RunOutput = Vec::new();
        let mut last_checkpoint = None;

        for (index, target) in targets.iter().enumerate() {
            if index > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }

            let report = &mut reports[index];
            report.state = HotelState::InProgress;
            let limits = ExtractLimits {
                max_reviews: plan.reviews_per_hotel,
                stop_date: None,
                ordering: plan.ordering,
            };

            let outcome = self
                .crawl_hotel(source, target, limits, watermarks)
                .instrument(info_span!("hotel", hotel = %target.name, index))
                .await;

            match outcome {
                Outcome::Ok(extraction) => {
                    report.state = HotelState::Completed;
                    report.reviews = extraction.document.reviews_count();
                    report.skipped_reviews = extraction.skipped;
                    report.pages_fetched = extraction.pages_fetched;
                    report.early_stop = matches!(extraction.stop_reason, StopReason::Watermark(_));
                    output.push(extraction.document);
                    last_checkpoint = Some(self.checkpoint(&plan.output_path, &output).await?);
                }
                Outcome::Failed(reason) | Outcome::Skipped(reason) => {
                    error!(
                        %run_id,
                        hotel = %target.name,
                        url = %target.url,
                        %reason,
                        "hotel failed; excluded from run output"
                    );
                    report.state = HotelState::Failed;
                    report.error = Some(reason);
                }
            }
        }

        if last_checkpoint.is_none() {
            last_checkpoint = Some(self.checkpoint(&plan.output_path, &output).await?);
        }

        Ok(CrawlSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: source.source_id().to_string(),
            output_path: plan.output_path.clone(),
            hotels_completed: count_state(&reports, HotelState::Completed),
            hotels_failed: count_state(&reports, HotelState::Failed),
            reviews_collected: output.iter().map(|h| h.reviews_count()).sum(),
            early_stops: reports.iter().filter(|r| r.early_stop).count(),
            last_checkpoint_sha256: last_checkpoint,
            hotels: reports,
        })
    }

    /// Extracts one hotel; extraction errors stay inside this hotel.
    ///
    /// The stop date comes from `watermarks` under the page-resolved hotel name,
    /// falling back to the target's name.
    pub async fn crawl_hotel(
        &self,
        source: &mut dyn ReviewSource,
        target: &HotelTarget,
        limits: ExtractLimits,
        watermarks: &Watermarks,
    ) -> Outcome<HotelExtraction> {
        match extract_hotel_since(source, target, limits, watermarks).await {
            Ok(extraction) => {
                info!(
                    reviews = extraction.document.reviews_count(),
                    skipped = extraction.skipped,
                    pages = extraction.pages_fetched,
                    stop = ?extraction.stop_reason,
                    "hotel extracted"
                );
                Outcome::Ok(extraction)
            }
            Err(err) => Outcome::Failed(err.to_string()),
        }
    }

    async fn checkpoint(&self, path: &Path, output: &RunOutput) -> Result<String, CrawlError> {
        let written = write_json_atomic(path, output)
            .await
            .map_err(|err| CrawlError::Checkpoint {
                path: path.to_path_buf(),
                reason: format!("{err:#}"),
            })?;
        info!(
            path = %written.path.display(),
            hotels = output.len(),
            bytes = written.byte_size,
            "checkpoint written"
        );
        Ok(written.sha256)
    }
}

fn count_state(reports: &[HotelReport], state: HotelState) -> usize {
    reports.iter().filter(|r| r.state == state).count()
}

/// Watermark Tracker: latest stored date per hotel, or none when the store is unavailable.
pub async fn load_watermarks(store: &dyn ReviewStore) -> Watermarks {
    match store.latest_review_dates().await {
        Ok(marks) => {
            info!(hotels = marks.len(), "watermarks loaded");
            marks
        }
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                "watermarks unavailable; crawling without early stop"
            );
            Watermarks::new()
        }
    }
}

pub async fn load_watermarks_from_database(database_url: &str) -> Watermarks {
    match PgReviewStore::connect(database_url).await {
        Ok(store) => {
            let marks = load_watermarks(&store).await;
            store.close().await;
            marks
        }
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                "review database unreachable; crawling without early stop"
            );
            Watermarks::new()
        }
    }
}

/// Loads watermarks, launches the HTML source and runs `plan`.
pub async fn run_crawl(config: &HarvestConfig, plan: &CrawlPlan) -> Result<CrawlSummary> {
    let watermarks = load_watermarks_from_database(&config.database_url).await;
    let launcher = config.launcher()?;
    let summary = CrawlOrchestrator::new(config.pacing)
        .run(&launcher, plan, &watermarks)
        .await?;
    Ok(summary)
}

/// Merges explicit files and directories (or the data dir) into the canonical file.
pub async fn run_merge(config: &HarvestConfig, inputs: &[PathBuf]) -> Result<MergeReport> {
    let roots = if inputs.is_empty() {
        vec![config.data_dir.clone()]
    } else {
        inputs.to_vec()
    };
    let mut files = Vec::new();
    for root in &roots {
        if root.is_dir() {
            files.extend(discover_run_files(root)?);
        } else {
            files.push(root.clone());
        }
    }
    if files.is_empty() {
        warn!(data_dir = %config.data_dir.display(), "no run-output files to merge");
    }
    merge_into(&files, &config.canonical_path()).await
}

pub async fn run_load(
    config: &HarvestConfig,
    file: &Path,
    mode: UpsertMode,
) -> Result<UpsertReport> {
    let doc = read_canonical_file(file).await?;
    let store = PgReviewStore::connect(&config.database_url).await?;
    let result = apply_canonical(&store, &doc, mode).await;
    store.close().await;
    result
}

pub async fn run_migrate(config: &HarvestConfig) -> Result<()> {
    let store = PgReviewStore::connect(&config.database_url).await?;
    let result = store.migrate().await;
    store.close().await;
    result?;
    info!("review database migrated");
    Ok(())
}

pub async fn run_watermarks(config: &HarvestConfig) -> Result<Watermarks> {
    let store = PgReviewStore::connect(&config.database_url).await?;
    let result = store.latest_review_dates().await;
    store.close().await;
    result
}
