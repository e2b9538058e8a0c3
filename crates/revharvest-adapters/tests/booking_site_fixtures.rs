use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use revharvest_adapters::{
    extract_hotel, load_fixture_site, parse_listing_page, parse_review_page, AdapterError,
    CompiledSelectors, ExtractLimits, HotelTarget, ReviewPage, ReviewSource, SiteSelectors,
    StopReason,
};
use revharvest_core::UNTITLED_REVIEW;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/booking-site")
        .canonicalize()
        .expect("fixture dir")
}

fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_dir().join(name)).expect("read fixture")
}

/// Serves the recorded HTML review pages through the HTML parser.
struct RecordedHtmlSource {
    selectors: CompiledSelectors,
    pages: Vec<String>,
}

#[async_trait]
impl ReviewSource for RecordedHtmlSource {
    fn source_id(&self) -> &'static str {
        "recorded-html"
    }

    async fn discover_hotels(
        &mut self,
        _entry_point: &str,
        _max_hotels: usize,
    ) -> Result<Vec<HotelTarget>, AdapterError> {
        Ok(Vec::new())
    }

    async fn fetch_review_page(
        &mut self,
        _hotel: &HotelTarget,
        page: usize,
    ) -> Result<ReviewPage, AdapterError> {
        let html = self
            .pages
            .get(page - 1)
            .ok_or_else(|| AdapterError::Message(format!("no recorded page {page}")))?;
        Ok(parse_review_page(html, &self.selectors))
    }
}

#[test]
fn listing_page_yields_unique_hotels_in_order() {
    let selectors = SiteSelectors::default().compile().unwrap();
    let targets = parse_listing_page(
        &read_fixture("listing.html"),
        "https://www.booking-site.test/city/da-nang-vn.html",
        &selectors,
        10,
    );

    let names = targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
    assert_eq!(
        names,
        vec!["Ocean Haven Resort", "Leaf Beachfront Hotel", "Sky Tower Hotel"]
    );
    assert_eq!(
        targets[0].url,
        "https://www.booking-site.test/ocean-haven-resort/hotel/da-nang-vn.html?cid=1922896"
    );

    let capped = parse_listing_page(
        &read_fixture("listing.html"),
        "https://www.booking-site.test/city/da-nang-vn.html",
        &selectors,
        2,
    );
    assert_eq!(capped.len(), 2);
}

#[test]
fn review_page_cards_become_raw_reviews() {
    let selectors = SiteSelectors::default().compile().unwrap();
    let page = parse_review_page(&read_fixture("review-page-1.html"), &selectors);

    assert_eq!(page.hotel_name.as_deref(), Some("Ocean Haven Resort"));
    assert_eq!(page.reviews.len(), 3);
    assert!(page.has_next);
    let first = &page.reviews[0];
    assert_eq!(first.reviewer_name.as_deref(), Some("Jane Doe"));
    assert_eq!(first.reviewer_country.as_deref(), Some("Australia"));
    assert_eq!(first.review_date.as_deref(), Some("Reviewed January 10, 2025"));
    assert_eq!(first.reviewer_score, Some(serde_json::json!(9.2)));

    let last = parse_review_page(&read_fixture("review-page-2.html"), &selectors);
    assert!(!last.has_next);
}

#[tokio::test]
async fn recorded_html_hotel_extracts_end_to_end() {
    let mut source = RecordedHtmlSource {
        selectors: SiteSelectors::default().compile().unwrap(),
        pages: vec![
            read_fixture("review-page-1.html"),
            read_fixture("review-page-2.html"),
        ],
    };
    let target = HotelTarget::from_url(
        "https://www.booking-site.test/ocean-haven-resort/hotel/da-nang-vn.html",
        Some("Ocean Haven Resort"),
    );

    let out = extract_hotel(&mut source, &target, ExtractLimits::new(20, None))
        .await
        .unwrap();

    assert_eq!(out.stop_reason, StopReason::Exhausted);
    assert_eq!(out.skipped, 1, "card with unreadable score is skipped");
    let reviews = &out.document.reviews;
    assert_eq!(reviews.len(), 3);
    assert_eq!(reviews[0].country, "Australia");
    assert_eq!(reviews[0].reviewer_score, 9.2);
    assert_eq!(reviews[1].reviewer_score, 10.0);
    assert_eq!(reviews[1].review_title, UNTITLED_REVIEW);
    assert_eq!(reviews[2].reviewer_score, 7.5);
    assert_eq!(reviews[2].review_date, None);
}

#[tokio::test]
async fn recorded_html_hotel_stops_at_watermark() {
    let mut source = RecordedHtmlSource {
        selectors: SiteSelectors::default().compile().unwrap(),
        pages: vec![
            read_fixture("review-page-1.html"),
            read_fixture("review-page-2.html"),
        ],
    };
    let target = HotelTarget::from_url(
        "https://www.booking-site.test/ocean-haven-resort/hotel/da-nang-vn.html",
        None,
    );
    let watermark = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();

    let out = extract_hotel(&mut source, &target, ExtractLimits::new(20, Some(watermark)))
        .await
        .unwrap();

    assert_eq!(out.document.reviews.len(), 1);
    assert_eq!(out.document.reviews[0].reviewer_name, "Jane Doe");
    assert_eq!(out.stop_reason, StopReason::Watermark(watermark));
    assert_eq!(out.pages_fetched, 1);
}

#[test]
fn fixture_site_loads() {
    let site = load_fixture_site(fixture_dir().join("site.json")).unwrap();
    assert_eq!(site.listing.len(), 3);
    assert_eq!(site.hotels.len(), 3);
}
