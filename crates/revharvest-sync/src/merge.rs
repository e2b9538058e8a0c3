//! Dedup/merge of run outputs into the canonical document.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use revharvest_core::{
    parse_run_document, CanonicalDocument, HotelDocument, NaturalKey, ReviewRecord, RunOutput,
};
use revharvest_storage::{write_json_atomic, WrittenDocument};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub input_records: usize,
    pub unique_records: usize,
    pub duplicates_removed: usize,
    pub hotels: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub input_files: Vec<PathBuf>,
    pub skipped_files: Vec<SkippedFile>,
    pub stats: MergeStats,
    pub output: Option<WrittenDocument>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// First-wins union of `inputs`, grouped by hotel name.
///
/// Records without a review date never match on the natural key; they collapse
/// only when every field equals a record already kept.
pub fn merge_run_outputs(inputs: &[RunOutput]) -> (CanonicalDocument, MergeStats) {
    let mut seen: HashSet<NaturalKey> = HashSet::new();
    let mut undated: HashMap<NaturalKey, Vec<ReviewRecord>> = HashMap::new();
    let mut grouped: BTreeMap<String, HotelDocument> = BTreeMap::new();
    let mut stats = MergeStats::default();

    for hotel in inputs.iter().flatten() {
        for record in &hotel.reviews {
            stats.input_records += 1;
            let key = record.natural_key();
            let duplicate = if key.is_matchable() {
                !seen.insert(key)
            } else {
                let kept = undated.entry(key).or_default();
                if kept.contains(record) {
                    true
                } else {
                    kept.push(record.clone());
                    false
                }
            };
            if duplicate {
                stats.duplicates_removed += 1;
                continue;
            }
            let entry = grouped
                .entry(record.hotel_name.clone())
                .or_insert_with(|| HotelDocument::new(record.hotel_name.clone(), None));
            if entry.hotel_url.is_none() && hotel.hotel_name == record.hotel_name {
                entry.hotel_url = hotel.hotel_url.clone();
            }
            entry.reviews.push(record.clone());
            stats.unique_records += 1;
        }
    }

    stats.hotels = grouped.len();
    (
        CanonicalDocument {
            hotels: grouped.into_values().collect(),
        },
        stats,
    )
}

fn is_merge_input(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".json")
        && !name.starts_with('.')
        && !lower.contains("cleaned")
        && !lower.contains("schema")
        && !lower.ends_with(".tmp")
}

/// Run-output files in `dir`, sorted by file name.
pub fn discover_run_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && is_merge_input(&path) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Reads and merges `paths` in order; unreadable files are reported and skipped.
pub async fn merge_files(paths: &[PathBuf]) -> (CanonicalDocument, MergeReport) {
    let mut report = MergeReport::default();
    let mut outputs: Vec<RunOutput> = Vec::with_capacity(paths.len());

    for path in paths {
        let parsed = match tokio::fs::read_to_string(path).await {
            Ok(text) => parse_run_document(&text).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match parsed {
            Ok(hotels) => {
                let skipped: usize = hotels.iter().map(|h| h.skipped.len()).sum();
                if skipped > 0 {
                    debug!(path = %path.display(), skipped, "malformed reviews skipped");
                }
                outputs.push(hotels.into_iter().map(|h| h.document).collect());
                report.input_files.push(path.clone());
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "skipping unreadable merge input");
                report.skipped_files.push(SkippedFile {
                    path: path.clone(),
                    reason,
                });
            }
        }
    }

    let (doc, stats) = merge_run_outputs(&outputs);
    report.stats = stats;
    (doc, report)
}

/// Merges `paths` and atomically writes the canonical document to `dest`.
pub async fn merge_into(paths: &[PathBuf], dest: &Path) -> Result<MergeReport> {
    let (doc, mut report) = merge_files(paths).await;
    let written = write_json_atomic(dest, &doc)
        .await
        .with_context(|| format!("writing canonical file {}", dest.display()))?;
    info!(
        path = %written.path.display(),
        files = report.input_files.len(),
        skipped_files = report.skipped_files.len(),
        input_records = report.stats.input_records,
        unique_records = report.stats.unique_records,
        duplicates = report.stats.duplicates_removed,
        hotels = report.stats.hotels,
        "canonical document written"
    );
    report.output = Some(written);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn rec(hotel: &str, reviewer: &str, date: Option<u32>, text: &str) -> ReviewRecord {
        ReviewRecord {
            hotel_name: hotel.to_string(),
            reviewer_name: reviewer.to_string(),
            reviewer_score: 8.0,
            review_text: text.to_string(),
            review_title: "Untitled review".to_string(),
            review_date: date.and_then(|d| NaiveDate::from_ymd_opt(2025, 1, d)),
            room_type: String::new(),
            stay_duration: String::new(),
            country: String::new(),
            traveler_type: String::new(),
        }
    }

    fn run(hotel: &str, records: Vec<ReviewRecord>) -> RunOutput {
        let mut doc = HotelDocument::new(hotel, None);
        doc.reviews = records;
        vec![doc]
    }

    #[test]
    fn merging_a_run_with_itself_changes_nothing() {
        let d = run(
            "Ocean Haven",
            vec![rec("Ocean Haven", "A", Some(1), "a"), rec("Ocean Haven", "B", Some(2), "b")],
        );
        let (once, _) = merge_run_outputs(std::slice::from_ref(&d));
        let (twice, stats) = merge_run_outputs(&[d.clone(), d]);
        assert_eq!(once, twice);
        assert_eq!(stats.duplicates_removed, 2);
        assert_eq!(twice.hotels[0].reviews_count(), 2);
    }

    #[test]
    fn first_input_wins_on_duplicate_keys() {
        let a = run("H", vec![rec("H", "Jane", Some(10), "from A")]);
        let b = run("H", vec![rec("H", "Jane", Some(10), "from B")]);
        let (ab, _) = merge_run_outputs(&[a.clone(), b.clone()]);
        let (ba, _) = merge_run_outputs(&[b, a]);
        assert_eq!(ab.hotels[0].reviews[0].review_text, "from A");
        assert_eq!(ba.hotels[0].reviews[0].review_text, "from B");
    }

    #[test]
    fn undated_records_only_collapse_when_identical() {
        let d = run(
            "H",
            vec![
                rec("H", "Jane", None, "first stay"),
                rec("H", "Jane", None, "second stay"),
                rec("H", "Jane", Some(3), "dated"),
            ],
        );
        let (once, _) = merge_run_outputs(std::slice::from_ref(&d));
        let (twice, stats) = merge_run_outputs(&[d.clone(), d]);
        assert_eq!(once, twice);
        assert_eq!(twice.review_count(), 3);
        assert_eq!(stats.duplicates_removed, 3);

        let edited = run("H", vec![rec("H", "Jane", None, "first stay, edited")]);
        let (doc, _) = merge_run_outputs(&[once.hotels.clone(), edited]);
        assert_eq!(doc.review_count(), 4);
    }

    #[test]
    fn records_are_regrouped_by_their_hotel() {
        let mut mixed = HotelDocument::new("A", Some("https://www.s.com/a/hotel/x.html".into()));
        mixed.reviews = vec![rec("A", "x", Some(1), ""), rec("B", "y", Some(1), "")];
        let (doc, stats) = merge_run_outputs(&[vec![mixed]]);
        assert_eq!(stats.hotels, 2);
        assert_eq!(doc.hotels[0].hotel_name, "A");
        assert!(doc.hotels[0].hotel_url.is_some());
        assert_eq!(doc.hotels[1].hotel_name, "B");
        assert!(doc.hotels[1].hotel_url.is_none());
    }

    #[test]
    fn discovery_skips_canonical_schema_hidden_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "20250102_000000.json",
            "20250101_000000.json",
            "reviews_cleaned.json",
            "reviews_schema.json",
            ".20250103_000000.json.abc.tmp",
            ".hidden.json",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), "[]").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.json")).unwrap();

        let files = discover_run_files(dir.path()).unwrap();
        let names = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["20250101_000000.json", "20250102_000000.json"]);
    }

    #[tokio::test]
    async fn corrupt_inputs_are_reported_and_legacy_files_merge() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("20250101_000000.json");
        let legacy = dir.path().join("20250102_000000.json");
        let broken = dir.path().join("20250103_000000.json");
        std::fs::write(
            &iso,
            r#"[{"hotel_name": "Ocean Haven", "reviews": [
                {"hotel_name": "Ocean Haven", "reviewer_name": "Jane Doe", "reviewer_score": 9.0,
                 "review_text": "Great", "review_title": "Wow", "review_date": "2025-01-10",
                 "room_type": "", "stay_duration": "", "country": "", "traveler_type": ""}
            ], "reviews_count": 1}]"#,
        )
        .unwrap();
        std::fs::write(
            &legacy,
            r#"{"hotel_name": "Ocean Haven", "reviews": [
                {"reviewer_name": "Jane Doe", "reviewer_score": "9,0", "review_text": "Later copy",
                 "review_date": "Reviewed January 10, 2025", "reviewer_country": "Vietnam"},
                {"reviewer_name": "Minh", "review_text": "Good",
                 "review_date": "Reviewed January 02, 2025"}
            ]}"#,
        )
        .unwrap();
        std::fs::write(&broken, "{not json").unwrap();

        let dest = dir.path().join("reviews_cleaned.json");
        let files = discover_run_files(dir.path()).unwrap();
        let report = merge_into(&files, &dest).await.unwrap();

        assert_eq!(report.input_files.len(), 2);
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(report.skipped_files[0].path, broken);
        assert_eq!(report.stats.input_records, 3);
        assert_eq!(report.stats.duplicates_removed, 1);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&dest).unwrap()).unwrap();
        assert_eq!(written[0]["hotel_name"], "Ocean Haven");
        assert_eq!(written[0]["reviews_count"], 2);
        assert_eq!(written[0]["reviews"][0]["review_text"], "Great");
        assert_eq!(written[0]["reviews"][1]["review_date"], "2025-01-02");

        // canonical output is excluded from the next discovery
        assert_eq!(discover_run_files(dir.path()).unwrap().len(), 3);
    }
}
