//! Error taxonomy for the history core.
//!
//! Three layers: `ValidationError` rejects a single malformed run report,
//! `StorageError` covers the backend seam, and `LedgerError` is the
//! operation-level union surfaced to the caller (typically a CI job).
//! Absence is not an error anywhere in the query surface: unknown tools and
//! measurement names yield empty results.

use std::time::Duration;

use thiserror::Error;

/// Rejection of a single incoming run report. The store is untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("run is missing a tool name")]
    MissingTool,

    #[error("run is missing a commit id")]
    MissingCommitId,

    #[error("run carries no measurements")]
    EmptyBenches,

    #[error("measurement `{name}`: value {value} is not a finite non-negative number")]
    BadValue { name: String, value: f64 },

    #[error("measurement `{name}`: range `{raw}` does not normalize to a numeric bound")]
    BadRange { name: String, raw: String },

    #[error("measurement `{name}` appears more than once in the run")]
    DuplicateMeasurement { name: String },
}

/// Failure at the storage seam.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The document revision moved between load and store.
    #[error("revision conflict: document changed since it was loaded")]
    Conflict,

    #[error("storage operation exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("storage unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
}

/// Operation-level error returned by the history store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Optimistic write retries exhausted. The store is guaranteed unchanged
    /// by this call; retrying the whole append later is safe.
    #[error("append conflict not resolved after {attempts} attempts")]
    ConflictExceeded { attempts: u32 },

    #[error("storage operation exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("storage unavailable: {0}")]
    Unavailable(#[source] std::io::Error),

    /// The persisted document failed to decode.
    #[error("persisted dataset is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
