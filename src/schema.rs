//! Persisted dataset schema and the document codec.
//!
//! One document per repository, holding every recorded benchmark run:
//!
//! ```text
//! {
//!   "lastUpdate": 1713288545979,          // epoch millis, bumped on apply
//!   "repoUrl": "https://github.com/...",
//!   "entries": {
//!     "<tool>": [                          // ordered by run date, append-only
//!       {
//!         "commit": { "author": {..}, "committer": {..}, "distinct": true,
//!                     "id": "...", "message": "...", "timestamp": "ISO8601",
//!                     "tree_id": "...", "url": "..." },
//!         "date": 1713288545433,           // ingestion time, epoch millis
//!         "tool": "cargo",
//!         "benches": [
//!           { "name": "...", "value": 2285716, "range": "± 10143",
//!             "unit": "ns/iter" }
//!         ]
//!       }
//!     ]
//!   }
//! }
//! ```
//!
//! Published artifacts frame the same object as a JavaScript assignment
//! (`window.BENCHMARK_DATA = { ... };`) so the chart page can load it with a
//! plain `<script>` tag. The codec accepts either framing on decode and can
//! produce both on encode.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Assignment target used by the JavaScript framing.
const WINDOW_TARGET: &str = "window.BENCHMARK_DATA";

/// Root document for one source repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Epoch millis of the most recent successful apply. Always at or above
    /// the `date` of every stored run.
    #[serde(rename = "lastUpdate")]
    pub last_update: i64,
    #[serde(rename = "repoUrl")]
    pub repo_url: String,
    /// Tool name to its recorded runs, oldest first.
    pub entries: BTreeMap<String, Vec<Run>>,
}

impl Dataset {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            last_update: 0,
            repo_url: repo_url.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Runs recorded for a tool, oldest first. Empty for an unknown tool.
    pub fn runs(&self, tool: &str) -> &[Run] {
        self.entries.get(tool).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// One benchmark execution tied to one commit. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub commit: CommitRef,
    /// Ingestion time in epoch millis, distinct from the commit timestamp.
    pub date: i64,
    /// Harness self-description (e.g. "cargo"); not required to match the
    /// entries key the run is stored under.
    pub tool: String,
    pub benches: Vec<Measurement>,
}

impl Run {
    /// Look up a measurement by name.
    pub fn measurement(&self, name: &str) -> Option<&Measurement> {
        self.benches.iter().find(|m| m.name == name)
    }
}

/// Identity of the measured commit, as reported by the source-control host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRef {
    pub author: GitUser,
    pub committer: GitUser,
    pub distinct: bool,
    pub id: String,
    pub message: String,
    /// ISO 8601 commit timestamp, stored verbatim.
    pub timestamp: String,
    pub tree_id: String,
    pub url: String,
}

impl CommitRef {
    /// Parse the commit timestamp. `None` when the host sent something that
    /// is not RFC 3339; the raw string is still preserved on the wire.
    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitUser {
    pub email: String,
    pub name: String,
    pub username: String,
}

/// One named metric within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    /// Point estimate (mean) of the timing.
    #[serde(serialize_with = "serialize_number")]
    pub value: f64,
    pub range: Range,
    pub unit: String,
}

/// Largest f64 that is safely an integer on the JavaScript side (2^53 - 1).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// The pipeline publishes integral timings as JSON integers; keep them that
/// way so a re-serialized document matches what was published.
fn serialize_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Measurement noise as it appears on the wire: a bare number or an annotated
/// string like `"± 10143"`. The raw form is preserved so historical records
/// re-serialize exactly as they were written.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Range {
    Number(f64),
    Text(String),
}

impl Serialize for Range {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Range::Number(n) => serialize_number(n, serializer),
            Range::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl Range {
    /// Normalized absolute bound. `None` when the text form does not parse
    /// as a number.
    pub fn bound(&self) -> Option<f64> {
        match self {
            Range::Number(n) => Some(n.abs()),
            Range::Text(s) => {
                let s = s.trim();
                let s = s
                    .strip_prefix('±')
                    .or_else(|| s.strip_prefix("+/-"))
                    .unwrap_or(s);
                s.trim().parse::<f64>().ok().map(f64::abs)
            }
        }
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Range::Number(n) => write!(f, "{n}"),
            Range::Text(s) => f.write_str(s),
        }
    }
}

/// On-disk framing of the dataset document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DocumentFormat {
    /// Bare JSON.
    #[default]
    Json,
    /// `window.BENCHMARK_DATA = { ... };` — loadable by the chart page.
    WindowAssignment,
}

/// Serialize a dataset in the requested framing (2-space pretty-printed,
/// exactly as the published artifacts are).
pub fn encode_document(
    dataset: &Dataset,
    format: DocumentFormat,
) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_string_pretty(dataset)?;
    Ok(match format {
        DocumentFormat::Json => json.into_bytes(),
        DocumentFormat::WindowAssignment => format!("{WINDOW_TARGET} = {json}").into_bytes(),
    })
}

/// Deserialize a dataset, auto-detecting the framing. Tolerates a trailing
/// semicolon and surrounding whitespace around the assignment.
pub fn decode_document(bytes: &[u8]) -> Result<Dataset, serde_json::Error> {
    let text = String::from_utf8_lossy(bytes);
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix(WINDOW_TARGET) {
        text = rest.trim_start().strip_prefix('=').unwrap_or(rest).trim();
    }
    text = text.strip_suffix(';').unwrap_or(text).trim_end();
    serde_json::from_str(text)
}

/// Current wall-clock time in epoch millis, the unit `date` and `lastUpdate`
/// are recorded in.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset() -> Dataset {
        let run = Run {
            commit: CommitRef {
                author: GitUser {
                    email: "dev@example.com".to_string(),
                    name: "Dev".to_string(),
                    username: "dev".to_string(),
                },
                committer: GitUser {
                    email: "noreply@github.com".to_string(),
                    name: "GitHub".to_string(),
                    username: "web-flow".to_string(),
                },
                distinct: true,
                id: "a94674d63e2e".to_string(),
                message: "fix(ci): fix benchmark workflow".to_string(),
                timestamp: "2024-04-16T17:01:17Z".to_string(),
                tree_id: "775d13996a87".to_string(),
                url: "https://github.com/example/repo/commit/a94674d63e2e".to_string(),
            },
            date: 1_713_288_545_433,
            tool: "cargo".to_string(),
            benches: vec![
                Measurement {
                    name: "explain-q1".to_string(),
                    value: 2_285_716.0,
                    range: Range::Text("± 10143".to_string()),
                    unit: "ns/iter".to_string(),
                },
                Measurement {
                    name: "explain-q2".to_string(),
                    value: 355_970_844.0,
                    range: Range::Number(9_388_233.0),
                    unit: "ns/iter".to_string(),
                },
            ],
        };
        let mut dataset = Dataset::new("https://github.com/example/repo");
        dataset.last_update = 1_713_288_545_979;
        dataset.entries.insert("Rust Benchmark".to_string(), vec![run]);
        dataset
    }

    #[test]
    fn test_json_round_trip_preserves_range_forms() {
        let dataset = sample_dataset();
        let bytes = encode_document(&dataset, DocumentFormat::Json).unwrap();
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(decoded, dataset);

        let benches = &decoded.entries["Rust Benchmark"][0].benches;
        assert_eq!(benches[0].range, Range::Text("± 10143".to_string()));
        assert_eq!(benches[1].range, Range::Number(9_388_233.0));
    }

    #[test]
    fn test_window_assignment_round_trip() {
        let dataset = sample_dataset();
        let bytes = encode_document(&dataset, DocumentFormat::WindowAssignment).unwrap();

        // Published artifacts carry the bare assignment, no trailing semicolon.
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("window.BENCHMARK_DATA = {"));
        assert!(text.ends_with('}'));

        assert_eq!(decode_document(&bytes).unwrap(), dataset);
    }

    #[test]
    fn test_decode_tolerates_semicolon_and_whitespace() {
        let dataset = sample_dataset();
        let json = serde_json::to_string_pretty(&dataset).unwrap();
        let framed = format!("window.BENCHMARK_DATA = {json};\n");
        assert_eq!(decode_document(framed.as_bytes()).unwrap(), dataset);
    }

    #[test]
    fn test_integral_values_encode_as_json_integers() {
        let dataset = sample_dataset();
        let text = String::from_utf8(encode_document(&dataset, DocumentFormat::Json).unwrap())
            .unwrap();
        assert!(text.contains("\"value\": 2285716,"));
        assert!(text.contains("\"range\": 9388233,"));
        assert!(!text.contains("2285716.0"));
    }

    #[test]
    fn test_now_millis_is_epoch_scaled() {
        // Sanity-check the unit: past 2023-11 and below the year 2286.
        let now = now_millis();
        assert!(now > 1_700_000_000_000);
        assert!(now < 10_000_000_000_000);
    }

    #[test]
    fn test_range_bound_normalization() {
        assert_eq!(Range::Text("± 10143".to_string()).bound(), Some(10_143.0));
        assert_eq!(Range::Text("±7".to_string()).bound(), Some(7.0));
        assert_eq!(Range::Text("+/- 2.5".to_string()).bound(), Some(2.5));
        assert_eq!(Range::Text("12.5".to_string()).bound(), Some(12.5));
        assert_eq!(Range::Number(-3.0).bound(), Some(3.0));
        assert_eq!(Range::Text("fast".to_string()).bound(), None);
    }

    #[test]
    fn test_commit_timestamp_parsing() {
        let dataset = sample_dataset();
        let commit = &dataset.entries["Rust Benchmark"][0].commit;
        let parsed = commit.parsed_timestamp().unwrap();
        assert_eq!(parsed.timestamp(), 1_713_286_877);

        let mut bad = commit.clone();
        bad.timestamp = "yesterday".to_string();
        assert!(bad.parsed_timestamp().is_none());
    }

    #[test]
    fn test_runs_for_unknown_tool_is_empty() {
        let dataset = sample_dataset();
        assert!(dataset.runs("go").is_empty());
        assert_eq!(dataset.runs("Rust Benchmark").len(), 1);
    }
}
