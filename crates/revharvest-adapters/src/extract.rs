//! Per-hotel review extraction with watermark-driven early stop.

use std::collections::VecDeque;

use chrono::NaiveDate;
use revharvest_core::{
    is_unknown_hotel_name, normalize_review, resolve_hotel_name, HotelDocument, Outcome,
    RawReview, ReviewRecord, Watermarks,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{AdapterError, HotelTarget, ReviewSource};

/// How far to trust the site's newest-first review order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingPolicy {
    /// Stop at the first review on or before the watermark.
    TrustOrdering,
    /// Same, but stop honouring the watermark once a review is newer than its predecessor.
    #[default]
    VerifyOrdering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    pub max_reviews: usize,
    pub stop_date: Option<NaiveDate>,
    pub ordering: OrderingPolicy,
}

impl ExtractLimits {
    pub fn new(max_reviews: usize, stop_date: Option<NaiveDate>) -> Self {
        Self {
            max_reviews,
            stop_date,
            ordering: OrderingPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    MaxReviews,
    Watermark(NaiveDate),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction failed for {hotel} at review page {page}: {source}")]
    Fetch {
        hotel: String,
        page: usize,
        #[source]
        source: AdapterError,
    },
}

/// Lazy walk over one hotel's reviews; pages are fetched only when needed.
///
/// A cursor cannot be rewound: a new cursor starts again from the first page.
pub struct HotelReviewCursor<'a> {
    source: &'a mut dyn ReviewSource,
    target: &'a HotelTarget,
    limits: ExtractLimits,
    watermarks: Option<&'a Watermarks>,
    hotel_name: Option<String>,
    buffer: VecDeque<RawReview>,
    next_page: usize,
    more_pages: bool,
    emitted: usize,
    skipped: usize,
    last_date: Option<NaiveDate>,
    honour_watermark: bool,
    stopped: Option<StopReason>,
}

impl<'a> HotelReviewCursor<'a> {
    pub fn new(
        source: &'a mut dyn ReviewSource,
        target: &'a HotelTarget,
        limits: ExtractLimits,
    ) -> Self {
        Self {
            source,
            target,
            limits,
            watermarks: None,
            hotel_name: None,
            buffer: VecDeque::new(),
            next_page: 1,
            more_pages: true,
            emitted: 0,
            skipped: 0,
            last_date: None,
            honour_watermark: true,
            stopped: None,
        }
    }

    /// Takes the stop date from `watermarks` once the first page names the hotel.
    ///
    /// The page-resolved name is looked up first, then the target's name.
    pub fn with_watermarks(mut self, watermarks: &'a Watermarks) -> Self {
        self.watermarks = Some(watermarks);
        self
    }

    /// Name from the first fetched page, else the target's.
    pub fn hotel_name(&self) -> &str {
        self.hotel_name.as_deref().unwrap_or(&self.target.name)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn pages_fetched(&self) -> usize {
        self.next_page - 1
    }

    pub async fn next(&mut self) -> Result<Option<ReviewRecord>, ExtractError> {
        loop {
            if self.stopped.is_some() {
                return Ok(None);
            }
            if self.emitted >= self.limits.max_reviews {
                self.stopped = Some(StopReason::MaxReviews);
                return Ok(None);
            }
            let Some(raw) = self.buffer.pop_front() else {
                if !self.more_pages {
                    self.stopped = Some(StopReason::Exhausted);
                    return Ok(None);
                }
                self.fetch_next_page().await?;
                continue;
            };

            let record = match normalize_review(&raw, self.hotel_name()) {
                Outcome::Ok(record) => record,
                other => {
                    self.skipped += 1;
                    debug!(
                        hotel = self.hotel_name(),
                        reason = other.reason().unwrap_or_default(),
                        "skipping review"
                    );
                    continue;
                }
            };

            if let Some(date) = record.review_date {
                if self.should_stop_at(date) {
                    return Ok(None);
                }
                self.last_date = Some(date);
            }

            self.emitted += 1;
            return Ok(Some(record));
        }
    }

    fn should_stop_at(&mut self, date: NaiveDate) -> bool {
        if self.limits.ordering == OrderingPolicy::VerifyOrdering && self.honour_watermark {
            if let Some(previous) = self.last_date.filter(|prev| date > *prev) {
                warn!(
                    hotel = self.hotel_name(),
                    %previous,
                    %date,
                    "reviews are not newest-first; ignoring watermark for this hotel"
                );
                self.honour_watermark = false;
            }
        }
        match self.limits.stop_date {
            Some(stop) if self.honour_watermark && date <= stop => {
                self.stopped = Some(StopReason::Watermark(stop));
                true
            }
            _ => false,
        }
    }

    async fn fetch_next_page(&mut self) -> Result<(), ExtractError> {
        let page_no = self.next_page;
        let page = self
            .source
            .fetch_review_page(self.target, page_no)
            .await
            .map_err(|source| ExtractError::Fetch {
                hotel: self.target.name.clone(),
                page: page_no,
                source,
            })?;
        self.next_page += 1;

        if self.hotel_name.is_none() {
            let candidate = page
                .hotel_name
                .as_deref()
                .filter(|n| !is_unknown_hotel_name(n))
                .unwrap_or(&self.target.name);
            self.hotel_name = Some(resolve_hotel_name(Some(candidate), Some(&self.target.url)));

            if let Some(marks) = self.watermarks {
                let stop_date = marks
                    .get(self.hotel_name())
                    .or_else(|| marks.get(&self.target.name));
                self.limits.stop_date = stop_date;
            }
        }

        self.more_pages = page.has_next && !page.reviews.is_empty();
        self.buffer.extend(page.reviews);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HotelExtraction {
    pub document: HotelDocument,
    pub stop_reason: StopReason,
    pub skipped: usize,
    pub pages_fetched: usize,
}

/// Drains a fresh cursor into a [`HotelDocument`].
pub async fn extract_hotel(
    source: &mut dyn ReviewSource,
    target: &HotelTarget,
    limits: ExtractLimits,
) -> Result<HotelExtraction, ExtractError> {
    drain(HotelReviewCursor::new(source, target, limits), target).await
}

/// Like [`extract_hotel`], with the stop date looked up in `watermarks`.
pub async fn extract_hotel_since(
    source: &mut dyn ReviewSource,
    target: &HotelTarget,
    limits: ExtractLimits,
    watermarks: &Watermarks,
) -> Result<HotelExtraction, ExtractError> {
    let cursor = HotelReviewCursor::new(source, target, limits).with_watermarks(watermarks);
    drain(cursor, target).await
}

async fn drain(
    mut cursor: HotelReviewCursor<'_>,
    target: &HotelTarget,
) -> Result<HotelExtraction, ExtractError> {
    let mut reviews = Vec::new();
    while let Some(record) = cursor.next().await? {
        reviews.push(record);
    }
    let mut document = HotelDocument::new(cursor.hotel_name(), Some(target.url.clone()));
    document.reviews = reviews;
    Ok(HotelExtraction {
        document,
        stop_reason: cursor.stop_reason().unwrap_or(StopReason::Exhausted),
        skipped: cursor.skipped(),
        pages_fetched: cursor.pages_fetched(),
    })
}
