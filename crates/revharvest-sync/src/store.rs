//! Review store contract, PostgreSQL backend and in-memory backend.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use revharvest_core::{parse_run_document, CanonicalDocument, NaturalKey, ReviewRecord, Watermarks};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Rows per INSERT statement; 10 binds per row stays well under the protocol limit.
const UPSERT_CHUNK: usize = 1000;

const INSERT_COLUMNS: &str = "INSERT INTO reviews (hotel_name, reviewer_name, reviewer_score, \
     review_text, review_title, review_date, room_type, stay_duration, country, traveler_type) ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// Insert new reviews, leave stored ones untouched.
    Append,
    /// Insert new reviews and overwrite every mutable field of stored ones.
    Refresh,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub submitted: usize,
    pub collapsed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub ignored: usize,
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// `MAX(review_date)` per hotel; hotels with only undated reviews are absent.
    async fn latest_review_dates(&self) -> Result<Watermarks>;

    /// Applies `records` in one transaction; nothing is kept if any part fails.
    ///
    /// Callers pass batches already collapsed by [`collapse_batch`].
    async fn upsert_reviews(&self, records: &[ReviewRecord], mode: UpsertMode)
        -> Result<UpsertReport>;

    async fn review_counts_by_hotel(&self) -> Result<Vec<(String, i64)>>;
}

/// Store-side identity: unlike merge, two undated reviews of the same hotel and reviewer collide.
fn store_key(record: &ReviewRecord) -> NaturalKey {
    record.natural_key()
}

/// Removes in-batch key collisions so one statement never touches a row twice.
///
/// Append keeps the first record per key, refresh the last, both at the first's position.
pub fn collapse_batch(records: &[ReviewRecord], mode: UpsertMode) -> Vec<ReviewRecord> {
    let mut out: Vec<ReviewRecord> = Vec::with_capacity(records.len());
    let mut index: HashMap<NaturalKey, usize> = HashMap::new();
    for record in records {
        match index.get(&store_key(record)) {
            Some(&idx) => {
                if mode == UpsertMode::Refresh {
                    out[idx] = record.clone();
                }
            }
            None => {
                index.insert(store_key(record), out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

pub fn conflict_clause(mode: UpsertMode) -> &'static str {
    match mode {
        UpsertMode::Append => "ON CONFLICT (hotel_name, reviewer_name, review_date) DO NOTHING",
        UpsertMode::Refresh => {
            "ON CONFLICT (hotel_name, reviewer_name, review_date) DO UPDATE SET \
             reviewer_score = EXCLUDED.reviewer_score, \
             review_text = EXCLUDED.review_text, \
             review_title = EXCLUDED.review_title, \
             room_type = EXCLUDED.room_type, \
             stay_duration = EXCLUDED.stay_duration, \
             country = EXCLUDED.country, \
             traveler_type = EXCLUDED.traveler_type"
        }
    }
}

pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("connecting to review database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running review database migrations")
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn latest_review_dates(&self) -> Result<Watermarks> {
        let rows = sqlx::query(
            "SELECT hotel_name, MAX(review_date) AS latest FROM reviews GROUP BY hotel_name",
        )
        .fetch_all(&self.pool)
        .await
        .context("querying latest review dates")?;

        let mut marks = Watermarks::new();
        for row in rows {
            let hotel: String = row.try_get("hotel_name")?;
            let latest: Option<NaiveDate> = row.try_get("latest")?;
            if let Some(latest) = latest {
                marks.insert(hotel, latest);
            }
        }
        Ok(marks)
    }

    async fn upsert_reviews(
        &self,
        records: &[ReviewRecord],
        mode: UpsertMode,
    ) -> Result<UpsertReport> {
        let mut report = UpsertReport {
            submitted: records.len(),
            ..Default::default()
        };
        // Dropping the transaction on an early return rolls back every chunk.
        let mut tx = self.pool.begin().await.context("beginning upsert transaction")?;

        for chunk in records.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_COLUMNS);
            qb.push_values(chunk, |mut row, r| {
                row.push_bind(r.hotel_name.clone())
                    .push_bind(r.reviewer_name.clone())
                    .push_bind(r.reviewer_score)
                    .push_bind(r.review_text.clone())
                    .push_bind(r.review_title.clone())
                    .push_bind(r.review_date)
                    .push_bind(r.room_type.clone())
                    .push_bind(r.stay_duration.clone())
                    .push_bind(r.country.clone())
                    .push_bind(r.traveler_type.clone());
            });
            qb.push(" ");
            qb.push(conflict_clause(mode));
            qb.push(" RETURNING (xmax = 0) AS inserted");

            let rows = qb
                .build()
                .fetch_all(&mut *tx)
                .await
                .context("upserting review chunk")?;

            let mut inserted = 0usize;
            for row in &rows {
                if row.try_get::<bool, _>("inserted")? {
                    inserted += 1;
                }
            }
            report.inserted += inserted;
            match mode {
                UpsertMode::Append => report.ignored += chunk.len() - rows.len(),
                UpsertMode::Refresh => report.updated += rows.len() - inserted,
            }
        }

        tx.commit().await.context("committing upsert transaction")?;
        Ok(report)
    }

    async fn review_counts_by_hotel(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT hotel_name, COUNT(*) AS review_count FROM reviews \
             GROUP BY hotel_name ORDER BY review_count DESC, hotel_name",
        )
        .fetch_all(&self.pool)
        .await
        .context("counting reviews by hotel")?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let hotel: String = row.try_get("hotel_name")?;
            let count: i64 = row.try_get("review_count")?;
            counts.push((hotel, count));
        }
        Ok(counts)
    }
}

/// Store kept in memory with the same conflict semantics as the `reviews` table.
#[derive(Debug, Default)]
pub struct MemoryReviewStore {
    rows: Mutex<BTreeMap<NaturalKey, ReviewRecord>>,
    unreachable: bool,
    fail_after: Option<usize>,
}

impl MemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails as if the database could not be reached.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    /// Upserts fail after applying `n` records of a batch.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Default::default()
        }
    }

    pub async fn rows(&self) -> Vec<ReviewRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.unreachable {
            bail!("review store unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl ReviewStore for MemoryReviewStore {
    async fn latest_review_dates(&self) -> Result<Watermarks> {
        self.ensure_reachable()?;
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter_map(|r| r.review_date.map(|d| (r.hotel_name.clone(), d)))
            .collect())
    }

    async fn upsert_reviews(
        &self,
        records: &[ReviewRecord],
        mode: UpsertMode,
    ) -> Result<UpsertReport> {
        self.ensure_reachable()?;
        let mut rows = self.rows.lock().await;
        let mut staged = rows.clone();
        let mut report = UpsertReport {
            submitted: records.len(),
            ..Default::default()
        };

        for (applied, record) in records.iter().enumerate() {
            if self.fail_after == Some(applied) {
                bail!("simulated failure after {applied} records");
            }
            match staged.get_mut(&store_key(record)) {
                None => {
                    staged.insert(store_key(record), record.clone());
                    report.inserted += 1;
                }
                Some(_) if mode == UpsertMode::Append => report.ignored += 1,
                Some(existing) => {
                    *existing = record.clone();
                    report.updated += 1;
                }
            }
        }

        *rows = staged;
        Ok(report)
    }

    async fn review_counts_by_hotel(&self) -> Result<Vec<(String, i64)>> {
        self.ensure_reachable()?;
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for record in self.rows.lock().await.values() {
            *counts.entry(record.hotel_name.clone()).or_default() += 1;
        }
        let mut out = counts.into_iter().collect::<Vec<_>>();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(out)
    }
}

/// Reads a canonical (or any run-output) file through the normalizer.
pub async fn read_canonical_file(path: &Path) -> Result<CanonicalDocument> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let hotels = parse_run_document(&text).with_context(|| format!("parsing {}", path.display()))?;
    let mut doc = CanonicalDocument::default();
    for hotel in hotels {
        if !hotel.skipped.is_empty() {
            warn!(
                hotel = %hotel.document.hotel_name,
                skipped = hotel.skipped.len(),
                "skipped malformed reviews while reading canonical file"
            );
        }
        doc.hotels.push(hotel.document);
    }
    Ok(doc)
}

/// Upsert Loader: applies a canonical document to the store under `mode`.
pub async fn apply_canonical(
    store: &dyn ReviewStore,
    doc: &CanonicalDocument,
    mode: UpsertMode,
) -> Result<UpsertReport> {
    let records = doc.records().cloned().collect::<Vec<_>>();
    if records.is_empty() {
        warn!("canonical document has no reviews; nothing to load");
        return Ok(UpsertReport::default());
    }

    let batch = collapse_batch(&records, mode);
    let mut report = store.upsert_reviews(&batch, mode).await?;
    report.submitted = records.len();
    report.collapsed = records.len() - batch.len();
    info!(
        ?mode,
        submitted = report.submitted,
        collapsed = report.collapsed,
        inserted = report.inserted,
        updated = report.updated,
        ignored = report.ignored,
        "reviews loaded"
    );

    match store.review_counts_by_hotel().await {
        Ok(counts) => {
            for (hotel, count) in counts {
                info!(hotel = %hotel, reviews = count, "stored reviews by hotel");
            }
        }
        Err(err) => warn!(error = %err, "could not read per-hotel review counts"),
    }
    Ok(report)
}
