//! Structural validation of an incoming run report.

use std::collections::BTreeSet;

use crate::error::ValidationError;
use crate::schema::Run;

/// Check a run report for structural well-formedness.
///
/// Pure: no logging, no store access. Soft checks that need history in scope
/// (unit drift, commit timestamp shape) happen on the append path instead.
pub fn validate(run: &Run) -> Result<(), ValidationError> {
    if run.tool.trim().is_empty() {
        return Err(ValidationError::MissingTool);
    }
    if run.commit.id.trim().is_empty() {
        return Err(ValidationError::MissingCommitId);
    }
    if run.benches.is_empty() {
        return Err(ValidationError::EmptyBenches);
    }

    let mut seen = BTreeSet::new();
    for m in &run.benches {
        if !m.value.is_finite() || m.value < 0.0 {
            return Err(ValidationError::BadValue {
                name: m.name.clone(),
                value: m.value,
            });
        }
        match m.range.bound() {
            Some(bound) if bound.is_finite() => {}
            _ => {
                return Err(ValidationError::BadRange {
                    name: m.name.clone(),
                    raw: m.range.to_string(),
                })
            }
        }
        if !seen.insert(m.name.as_str()) {
            return Err(ValidationError::DuplicateMeasurement {
                name: m.name.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CommitRef, GitUser, Measurement, Range};

    fn user() -> GitUser {
        GitUser {
            email: "dev@example.com".to_string(),
            name: "Dev".to_string(),
            username: "dev".to_string(),
        }
    }

    fn run_with(benches: Vec<Measurement>) -> Run {
        Run {
            commit: CommitRef {
                author: user(),
                committer: user(),
                distinct: true,
                id: "deadbeef".to_string(),
                message: "bench".to_string(),
                timestamp: "2024-04-16T17:01:17Z".to_string(),
                tree_id: "tree".to_string(),
                url: "https://example.com/commit/deadbeef".to_string(),
            },
            date: 1_700_000_000_000,
            tool: "cargo".to_string(),
            benches,
        }
    }

    fn bench(name: &str, value: f64, range: Range) -> Measurement {
        Measurement {
            name: name.to_string(),
            value,
            range,
            unit: "ns/iter".to_string(),
        }
    }

    #[test]
    fn test_accepts_well_formed_run() {
        let run = run_with(vec![
            bench("q1", 100.0, Range::Text("± 1".to_string())),
            bench("q2", 50.0, Range::Number(2.0)),
        ]);
        assert!(validate(&run).is_ok());
    }

    #[test]
    fn test_rejects_missing_tool() {
        let mut run = run_with(vec![bench("q1", 1.0, Range::Number(0.0))]);
        run.tool = "  ".to_string();
        assert_eq!(validate(&run), Err(ValidationError::MissingTool));
    }

    #[test]
    fn test_rejects_missing_commit_id() {
        let mut run = run_with(vec![bench("q1", 1.0, Range::Number(0.0))]);
        run.commit.id.clear();
        assert_eq!(validate(&run), Err(ValidationError::MissingCommitId));
    }

    #[test]
    fn test_rejects_empty_benches() {
        let run = run_with(Vec::new());
        assert_eq!(validate(&run), Err(ValidationError::EmptyBenches));
    }

    #[test]
    fn test_rejects_non_finite_and_negative_values() {
        for value in [f64::NAN, f64::INFINITY, -1.0] {
            let run = run_with(vec![bench("q1", value, Range::Number(0.0))]);
            assert!(matches!(
                validate(&run),
                Err(ValidationError::BadValue { .. })
            ));
        }
    }

    #[test]
    fn test_rejects_unparseable_range() {
        let run = run_with(vec![bench("q1", 1.0, Range::Text("± lots".to_string()))]);
        assert_eq!(
            validate(&run),
            Err(ValidationError::BadRange {
                name: "q1".to_string(),
                raw: "± lots".to_string(),
            })
        );
    }

    #[test]
    fn test_rejects_duplicate_measurement_names() {
        let run = run_with(vec![
            bench("q1", 1.0, Range::Number(0.0)),
            bench("q1", 2.0, Range::Number(0.0)),
        ]);
        assert_eq!(
            validate(&run),
            Err(ValidationError::DuplicateMeasurement {
                name: "q1".to_string(),
            })
        );
    }

    #[test]
    fn test_negative_range_normalizes_instead_of_failing() {
        // The bound is an absolute noise width; a stray sign is not an error.
        let run = run_with(vec![bench("q1", 1.0, Range::Number(-4.0))]);
        assert!(validate(&run).is_ok());
    }
}
