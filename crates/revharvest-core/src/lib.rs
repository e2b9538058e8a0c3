//! Core review model and ingestion-time normalization for revharvest.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "revharvest-core";

/// Hotel name used when neither the page nor the URL yields one.
pub const UNKNOWN_HOTEL: &str = "Unknown";
pub const UNTITLED_REVIEW: &str = "Untitled review";
pub const UNKNOWN_REVIEWER: &str = "Unknown";

const UNKNOWN_HOTEL_ALIASES: &[&str] = &["unknown", "unknown hotel"];

/// One guest review in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub hotel_name: String,
    pub reviewer_name: String,
    pub reviewer_score: f64,
    pub review_text: String,
    pub review_title: String,
    pub review_date: Option<NaiveDate>,
    pub room_type: String,
    pub stay_duration: String,
    pub country: String,
    pub traveler_type: String,
}

impl ReviewRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            hotel_name: self.hotel_name.clone(),
            reviewer_name: self.reviewer_name.clone(),
            review_date: self.review_date,
        }
    }
}

/// (hotel, reviewer, date) identity of a review across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub hotel_name: String,
    pub reviewer_name: String,
    pub review_date: Option<NaiveDate>,
}

impl NaturalKey {
    /// A key without a date never matches another key, including itself from another record.
    pub fn is_matchable(&self) -> bool {
        self.review_date.is_some()
    }
}

/// Reviews of one hotel within one run or file.
///
/// `reviews_count` is not stored; it is derived from `reviews` when serialized.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HotelDocument {
    pub hotel_name: String,
    pub hotel_url: Option<String>,
    pub reviews: Vec<ReviewRecord>,
}

impl HotelDocument {
    pub fn new(hotel_name: impl Into<String>, hotel_url: Option<String>) -> Self {
        Self {
            hotel_name: hotel_name.into(),
            hotel_url,
            reviews: Vec::new(),
        }
    }

    pub fn reviews_count(&self) -> usize {
        self.reviews.len()
    }
}

impl Serialize for HotelDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("HotelDocument", 4)?;
        state.serialize_field("hotel_name", &self.hotel_name)?;
        match &self.hotel_url {
            Some(url) => state.serialize_field("hotel_url", url)?,
            None => state.skip_field("hotel_url")?,
        }
        state.serialize_field("reviews", &self.reviews)?;
        state.serialize_field("reviews_count", &self.reviews.len())?;
        state.end()
    }
}

/// Output of one crawl invocation, in hotel completion order.
pub type RunOutput = Vec<HotelDocument>;

/// Deduplicated union of run outputs, grouped by hotel.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct CanonicalDocument {
    pub hotels: Vec<HotelDocument>,
}

impl CanonicalDocument {
    pub fn review_count(&self) -> usize {
        self.hotels.iter().map(HotelDocument::reviews_count).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &ReviewRecord> {
        self.hotels.iter().flat_map(|h| h.reviews.iter())
    }
}

/// Latest persisted review date per hotel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Watermarks(BTreeMap<String, NaiveDate>);

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hotel_name: &str) -> Option<NaiveDate> {
        self.0.get(hotel_name).copied()
    }

    /// Keeps the later date when a hotel is inserted twice.
    pub fn insert(&mut self, hotel_name: impl Into<String>, date: NaiveDate) {
        let entry = self.0.entry(hotel_name.into()).or_insert(date);
        if date > *entry {
            *entry = date;
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NaiveDate)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, NaiveDate)> for Watermarks {
    fn from_iter<I: IntoIterator<Item = (String, NaiveDate)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (hotel, date) in iter {
            out.insert(hotel, date);
        }
        out
    }
}

/// Result of one unit of best-effort work (a review, a hotel, a run).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    Skipped(String),
    Failed(String),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Skipped(reason) | Outcome::Failed(reason) => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(value) => Outcome::Ok(f(value)),
            Outcome::Skipped(reason) => Outcome::Skipped(reason),
            Outcome::Failed(reason) => Outcome::Failed(reason),
        }
    }
}

/// Review as produced by a scraper or an older output file, before normalization.
///
/// Field names vary between producers (`country` vs `reviewer_country`) and the
/// score may arrive as a number or as text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReview {
    #[serde(default)]
    pub hotel_name: Option<String>,
    #[serde(default)]
    pub reviewer_name: Option<String>,
    #[serde(default)]
    pub reviewer_score: Option<JsonValue>,
    #[serde(default)]
    pub review_text: Option<String>,
    #[serde(default)]
    pub review_title: Option<String>,
    #[serde(default)]
    pub review_date: Option<String>,
    #[serde(default)]
    pub room_type: Option<String>,
    #[serde(default)]
    pub stay_duration: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub reviewer_country: Option<String>,
    #[serde(default)]
    pub traveler_type: Option<String>,
}

/// Hotel object as found in any run-output or loose file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHotelDocument {
    #[serde(default)]
    pub hotel_name: Option<String>,
    #[serde(default)]
    pub hotel_url: Option<String>,
    #[serde(default)]
    pub reviews: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRunFile {
    Many(Vec<RawHotelDocument>),
    One(RawHotelDocument),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedHotel {
    pub document: HotelDocument,
    pub skipped: Vec<String>,
}

/// Parses "Reviewed October 02, 2025" or "2025-10-02"; anything else yields `None`.
pub fn parse_review_date(input: &str) -> Option<NaiveDate> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_prefix = trimmed
        .strip_prefix("Reviewed ")
        .unwrap_or(trimmed)
        .trim();
    NaiveDate::parse_from_str(without_prefix, "%B %d, %Y")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .ok()
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_score(value: Option<&JsonValue>) -> Result<f64, String> {
    let score = match value {
        None | Some(JsonValue::Null) => return Ok(0.0),
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) if s.trim().is_empty() => return Ok(0.0),
        Some(JsonValue::String(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
        Some(_) => None,
    };
    match score {
        Some(v) if v.is_finite() && (0.0..=10.0).contains(&v) => Ok(v),
        Some(v) => Err(format!("reviewer_score {v} outside 0..=10")),
        None => Err(format!("unparseable reviewer_score {:?}", value)),
    }
}

/// Derives "Leaf Beachfront Hotel" from `https://www.site.com/leaf-beachfront-hotel/hotel/x.html`.
pub fn hotel_name_from_url(url: &str) -> Option<String> {
    let idx = url.find("/hotel/")?;
    let slug = url[..idx].rsplit('/').next()?;
    if slug.is_empty() || slug.contains('.') {
        return None;
    }
    let name = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let lower = part.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

pub fn is_unknown_hotel_name(name: &str) -> bool {
    let lower = name.trim().to_lowercase();
    lower.is_empty() || UNKNOWN_HOTEL_ALIASES.contains(&lower.as_str())
}

/// Picks the page-provided name, else one recovered from the URL, else [`UNKNOWN_HOTEL`].
pub fn resolve_hotel_name(name: Option<&str>, url: Option<&str>) -> String {
    if let Some(name) = name.filter(|n| !is_unknown_hotel_name(n)) {
        return name.trim().to_string();
    }
    url.and_then(hotel_name_from_url)
        .unwrap_or_else(|| UNKNOWN_HOTEL.to_string())
}

/// Turns a raw review into a canonical record attributed to `hotel_name`.
pub fn normalize_review(raw: &RawReview, hotel_name: &str) -> Outcome<ReviewRecord> {
    let reviewer_name = text_or_none(raw.reviewer_name.as_deref());
    let review_text = text_or_none(raw.review_text.as_deref());
    let review_title = text_or_none(raw.review_title.as_deref());
    if reviewer_name.is_none() && review_text.is_none() && review_title.is_none() {
        return Outcome::Skipped("review has no reviewer, title or text".to_string());
    }

    let reviewer_score = match parse_score(raw.reviewer_score.as_ref()) {
        Ok(score) => score,
        Err(reason) => return Outcome::Skipped(reason),
    };

    let hotel_name = if is_unknown_hotel_name(hotel_name) {
        resolve_hotel_name(raw.hotel_name.as_deref(), None)
    } else {
        hotel_name.trim().to_string()
    };

    Outcome::Ok(ReviewRecord {
        hotel_name,
        reviewer_name: reviewer_name.unwrap_or_else(|| UNKNOWN_REVIEWER.to_string()),
        reviewer_score,
        review_text: review_text.unwrap_or_default(),
        review_title: review_title.unwrap_or_else(|| UNTITLED_REVIEW.to_string()),
        review_date: raw.review_date.as_deref().and_then(parse_review_date),
        room_type: text_or_none(raw.room_type.as_deref()).unwrap_or_default(),
        stay_duration: text_or_none(raw.stay_duration.as_deref()).unwrap_or_default(),
        country: text_or_none(raw.reviewer_country.as_deref())
            .or_else(|| text_or_none(raw.country.as_deref()))
            .unwrap_or_default(),
        traveler_type: text_or_none(raw.traveler_type.as_deref()).unwrap_or_default(),
    })
}

/// Normalizes every review of a raw hotel object; malformed entries are skipped.
pub fn normalize_hotel(raw: &RawHotelDocument) -> NormalizedHotel {
    let hotel_name = resolve_hotel_name(raw.hotel_name.as_deref(), raw.hotel_url.as_deref());
    let mut document = HotelDocument::new(hotel_name, raw.hotel_url.clone());
    let mut skipped = Vec::new();

    for (idx, value) in raw.reviews.iter().enumerate() {
        let review: RawReview = match serde_json::from_value(value.clone()) {
            Ok(review) => review,
            Err(err) => {
                skipped.push(format!("review #{idx}: {err}"));
                continue;
            }
        };
        match normalize_review(&review, &document.hotel_name) {
            Outcome::Ok(record) => document.reviews.push(record),
            other => skipped.push(format!(
                "review #{idx}: {}",
                other.reason().unwrap_or("skipped")
            )),
        }
    }

    NormalizedHotel { document, skipped }
}

/// Parses a run-output or loose file: an array of hotel objects or a single one.
pub fn parse_run_document(json: &str) -> Result<Vec<NormalizedHotel>, serde_json::Error> {
    let hotels = match serde_json::from_str::<RawRunFile>(json)? {
        RawRunFile::Many(hotels) => hotels,
        RawRunFile::One(hotel) => vec![hotel],
    };
    Ok(hotels.iter().map(normalize_hotel).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(reviewer: &str, date: &str) -> RawReview {
        RawReview {
            reviewer_name: Some(reviewer.to_string()),
            reviewer_score: Some(json!(8.4)),
            review_text: Some("Lovely stay".to_string()),
            review_date: Some(date.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn both_known_date_formats_parse_to_the_same_day() {
        let expected = NaiveDate::from_ymd_opt(2025, 10, 2);
        assert_eq!(parse_review_date("Reviewed October 02, 2025"), expected);
        assert_eq!(parse_review_date("2025-10-02"), expected);
    }

    #[test]
    fn unknown_date_formats_yield_none() {
        assert_eq!(parse_review_date("02/10/2025"), None);
        assert_eq!(parse_review_date("yesterday"), None);
        assert_eq!(parse_review_date(""), None);
        assert_eq!(parse_review_date("Reviewed Octember 40, 2025"), None);
        assert_eq!(parse_review_date("Reviewed 2025-10-02"), None);
        assert_eq!(parse_review_date("October 02, 2025"), NaiveDate::from_ymd_opt(2025, 10, 2));
    }

    #[test]
    fn unparseable_date_keeps_the_record() {
        let record = normalize_review(&raw("Jane Doe", "last week"), "Ocean Haven")
            .ok()
            .expect("record kept");
        assert_eq!(record.review_date, None);
        assert!(!record.natural_key().is_matchable());
    }

    #[test]
    fn reviewer_country_is_unified_into_country() {
        let mut review = raw("Jane Doe", "2025-01-10");
        review.reviewer_country = Some("Vietnam".to_string());
        review.country = Some("Ignored".to_string());
        let record = normalize_review(&review, "Ocean Haven").ok().unwrap();
        assert_eq!(record.country, "Vietnam");

        let mut review = raw("Jane Doe", "2025-01-10");
        review.country = Some("Japan".to_string());
        let record = normalize_review(&review, "Ocean Haven").ok().unwrap();
        assert_eq!(record.country, "Japan");
    }

    #[test]
    fn missing_title_gets_placeholder_and_score_accepts_text() {
        let mut review = raw("Jane Doe", "2025-01-10");
        review.reviewer_score = Some(json!("9,5"));
        let record = normalize_review(&review, "Ocean Haven").ok().unwrap();
        assert_eq!(record.review_title, UNTITLED_REVIEW);
        assert_eq!(record.reviewer_score, 9.5);
    }

    #[test]
    fn bad_scores_and_empty_reviews_are_skipped() {
        let mut review = raw("Jane Doe", "2025-01-10");
        review.reviewer_score = Some(json!(11.0));
        assert!(matches!(
            normalize_review(&review, "Ocean Haven"),
            Outcome::Skipped(_)
        ));

        review.reviewer_score = Some(json!("superb"));
        assert!(matches!(
            normalize_review(&review, "Ocean Haven"),
            Outcome::Skipped(_)
        ));

        assert!(matches!(
            normalize_review(&RawReview::default(), "Ocean Haven"),
            Outcome::Skipped(_)
        ));
    }

    #[test]
    fn hotel_name_is_recovered_from_url() {
        assert_eq!(
            hotel_name_from_url(
                "https://www.agoda.com/leaf-beachfront-hotel-da-nang/hotel/da-nang-vn.html?cid=1"
            )
            .as_deref(),
            Some("Leaf Beachfront Hotel Da Nang")
        );
        assert_eq!(hotel_name_from_url("https://www.agoda.com/hotel/x.html"), None);
        assert_eq!(hotel_name_from_url("https://www.agoda.com/city/da-nang.html"), None);
        assert_eq!(
            resolve_hotel_name(
                Some("Unknown Hotel"),
                Some("https://www.agoda.com/jbay-beachfront/hotel/x.html")
            ),
            "Jbay Beachfront"
        );
        assert_eq!(resolve_hotel_name(None, None), UNKNOWN_HOTEL);
    }

    #[test]
    fn hotel_document_serializes_derived_count() {
        let mut doc = HotelDocument::new("Ocean Haven", None);
        doc.reviews.push(
            normalize_review(&raw("Jane Doe", "Reviewed January 10, 2025"), "Ocean Haven")
                .ok()
                .unwrap(),
        );
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["reviews_count"], json!(1));
        assert_eq!(value["reviews"][0]["review_date"], json!("2025-01-10"));
        assert!(value.get("hotel_url").is_none());
    }

    #[test]
    fn run_documents_accept_array_or_single_hotel() {
        let single = r#"{"hotel_name": "Ocean Haven", "reviews": [
            {"reviewer_name": "Jane Doe", "reviewer_score": 9.0, "review_text": "Great",
             "review_date": "2025-01-10"},
            {"reviewer_name": 42},
            {}
        ]}"#;
        let hotels = parse_run_document(single).unwrap();
        assert_eq!(hotels.len(), 1);
        assert_eq!(hotels[0].document.reviews_count(), 1);
        assert_eq!(hotels[0].skipped.len(), 2);

        let many = r#"[
            {"hotel_name": "A", "reviews": []},
            {"hotel_url": "https://x.com/blue-bay/hotel/y.html"}
        ]"#;
        let hotels = parse_run_document(many).unwrap();
        assert_eq!(hotels.len(), 2);
        assert_eq!(hotels[1].document.hotel_name, "Blue Bay");
    }

    #[test]
    fn watermarks_keep_latest_date_per_hotel() {
        let marks: Watermarks = vec![
            ("A".to_string(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            ("A".to_string(), NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()),
            ("A".to_string(), NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()),
        ]
        .into_iter()
        .collect();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks.get("A"), NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(marks.get("B"), None);
    }

    #[test]
    fn outcome_reports_reason() {
        let skipped: Outcome<u8> = Outcome::Skipped("bad".into());
        assert_eq!(skipped.reason(), Some("bad"));
        assert_eq!(Outcome::Ok(2).map(|v| v * 2).ok(), Some(4));
    }
}
