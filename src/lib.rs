//! Core of a continuous-benchmarking pipeline: validate incoming run
//! reports, merge them into a durable append-only history, classify
//! regressions against the previous run, and answer trend queries.

pub mod detect;
pub mod error;
pub mod schema;
pub mod series;
pub mod store;
pub mod validate;

pub use detect::{Classification, Detector, DetectorConfig, Finding, RegressionReport};
pub use error::{LedgerError, StorageError, ValidationError};
pub use schema::{
    decode_document, encode_document, CommitRef, Dataset, DocumentFormat, GitUser, Measurement,
    Range, Run,
};
pub use series::{Series, SeriesPoint};
pub use store::{
    AppendResult, FileStorage, HistoryStore, MemoryStorage, Revision, Storage, StoreConfig,
};
pub use validate::validate;
