//! Read-only trend extraction, feeding chart rendering.

use std::sync::Arc;

use serde::Serialize;

use crate::schema::Run;

/// One plotted point of a measurement's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub commit_id: String,
    /// Ingestion time of the run, epoch millis.
    pub date: i64,
    pub value: f64,
    /// Normalized absolute noise bound.
    pub range: f64,
}

/// A named measurement's values across one tool's history, in run order.
///
/// Owns a snapshot of the history: iterating is unaffected by appends that
/// land after the series was taken. Runs that do not carry the named
/// measurement are skipped, not interpolated; gap handling is the chart
/// renderer's job.
#[derive(Debug, Clone)]
pub struct Series {
    runs: Arc<[Run]>,
    name: String,
}

impl Series {
    pub(crate) fn new(runs: Vec<Run>, name: &str) -> Self {
        Self {
            runs: runs.into(),
            name: name.to_string(),
        }
    }

    /// The measurement name this series tracks.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when no run in the snapshot carries the measurement.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Restartable iteration; every call starts over from the oldest run.
    pub fn iter(&self) -> SeriesIter<'_> {
        SeriesIter {
            runs: &self.runs,
            name: &self.name,
            idx: 0,
        }
    }
}

impl<'a> IntoIterator for &'a Series {
    type Item = SeriesPoint;
    type IntoIter = SeriesIter<'a>;

    fn into_iter(self) -> SeriesIter<'a> {
        self.iter()
    }
}

pub struct SeriesIter<'a> {
    runs: &'a [Run],
    name: &'a str,
    idx: usize,
}

impl Iterator for SeriesIter<'_> {
    type Item = SeriesPoint;

    fn next(&mut self) -> Option<SeriesPoint> {
        while self.idx < self.runs.len() {
            let run = &self.runs[self.idx];
            self.idx += 1;
            if let Some(m) = run.measurement(self.name) {
                return Some(SeriesPoint {
                    commit_id: run.commit.id.clone(),
                    date: run.date,
                    value: m.value,
                    range: m.range.bound().unwrap_or(0.0),
                });
            }
        }
        None
    }
}
