//! Append-only history store over a pluggable storage backend.
//!
//! Writers follow an optimistic read-merge-write cycle: load the current
//! document together with its revision, apply the insert, and write back
//! conditioned on the revision still matching. Racing CI jobs never lose each
//! other's runs; the loser of a race re-reads and re-applies, with bounded
//! exponential backoff between attempts.
//!
//! The store is an explicit handle over a [`Storage`] backend, never a
//! process-global. Tests run against [`MemoryStorage`]; deployments use
//! [`FileStorage`] with one document per repository.

use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::detect::{Detector, DetectorConfig, RegressionReport};
use crate::error::{LedgerError, StorageError};
use crate::schema::{self, Dataset, DocumentFormat, Run};
use crate::series::Series;
use crate::validate::validate;

/// Content revision of a persisted document: the compare-and-swap token for
/// optimistic writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision([u8; 32]);

impl Revision {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Revision(hasher.finalize().into())
    }
}

/// Storage seam for the persisted dataset document.
///
/// Implementations deal in opaque bytes; encoding and merging live above the
/// seam. Every call takes the caller's deadline and reports overrunning it as
/// [`StorageError::Timeout`], distinct from I/O failure.
pub trait Storage: Send + Sync {
    /// Read the current document, if any, with its revision.
    fn load(&self, timeout: Duration) -> Result<Option<(Vec<u8>, Revision)>, StorageError>;

    /// Write the document. With `expected` given, the write applies only if
    /// the stored revision still matches; with `None` it applies only if no
    /// document exists yet. Mismatch is [`StorageError::Conflict`].
    fn store(
        &self,
        bytes: &[u8],
        expected: Option<&Revision>,
        timeout: Duration,
    ) -> Result<Revision, StorageError>;
}

/// In-process backend with true compare-and-swap semantics. The fake the
/// rest of the crate is tested against.
#[derive(Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<(Vec<u8>, Revision)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, timeout: Duration) -> Result<Option<(Vec<u8>, Revision)>, StorageError> {
        let slot = self
            .slot
            .try_lock_for(timeout)
            .ok_or(StorageError::Timeout(timeout))?;
        Ok(slot.clone())
    }

    fn store(
        &self,
        bytes: &[u8],
        expected: Option<&Revision>,
        timeout: Duration,
    ) -> Result<Revision, StorageError> {
        let mut slot = self
            .slot
            .try_lock_for(timeout)
            .ok_or(StorageError::Timeout(timeout))?;
        if slot.as_ref().map(|(_, rev)| rev) != expected {
            return Err(StorageError::Conflict);
        }
        let revision = Revision::of(bytes);
        *slot = Some((bytes.to_vec(), revision.clone()));
        Ok(revision)
    }
}

/// One document per repository on the local filesystem.
///
/// Writes land in a sibling temp file and are renamed into place, so readers
/// never observe a torn document. The revision comparison runs under an
/// in-process lock; a document swapped in by another process is still caught
/// as a digest mismatch and surfaces as a conflict.
pub struct FileStorage {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn read_current(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Unavailable(e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        self.path.with_file_name(format!("{name}.tmp"))
    }
}

impl Storage for FileStorage {
    fn load(&self, timeout: Duration) -> Result<Option<(Vec<u8>, Revision)>, StorageError> {
        let _guard = self
            .guard
            .try_lock_for(timeout)
            .ok_or(StorageError::Timeout(timeout))?;
        Ok(self
            .read_current()?
            .map(|bytes| {
                let revision = Revision::of(&bytes);
                (bytes, revision)
            }))
    }

    fn store(
        &self,
        bytes: &[u8],
        expected: Option<&Revision>,
        timeout: Duration,
    ) -> Result<Revision, StorageError> {
        let _guard = self
            .guard
            .try_lock_for(timeout)
            .ok_or(StorageError::Timeout(timeout))?;

        let current = self.read_current()?.map(|b| Revision::of(&b));
        if current.as_ref() != expected {
            return Err(StorageError::Conflict);
        }

        let temp = self.temp_path();
        std::fs::write(&temp, bytes).map_err(StorageError::Unavailable)?;
        std::fs::rename(&temp, &self.path).map_err(StorageError::Unavailable)?;
        Ok(Revision::of(bytes))
    }
}

/// Store tuning. `repo_url` seeds a freshly created dataset; the rest govern
/// the optimistic write loop and on-disk framing.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub repo_url: String,
    pub format: DocumentFormat,
    /// Optimistic write attempts before `ConflictExceeded`.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between conflicting attempts.
    pub backoff_base: Duration,
    /// Deadline applied to each storage call.
    pub io_timeout: Duration,
    pub detector: DetectorConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            format: DocumentFormat::Json,
            max_attempts: 4,
            backoff_base: Duration::from_millis(10),
            io_timeout: Duration::from_secs(5),
            detector: DetectorConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn for_repo(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            ..Self::default()
        }
    }
}

/// Outcome of an append: whether the run was applied or dropped as a
/// duplicate of an already-recorded commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub applied: bool,
}

/// Durable, append-only per-tool run history.
pub struct HistoryStore<S: Storage> {
    storage: S,
    config: StoreConfig,
    detector: Detector,
}

impl<S: Storage> HistoryStore<S> {
    pub fn new(storage: S, config: StoreConfig) -> Self {
        let detector = Detector::new(config.detector.clone());
        Self {
            storage,
            config,
            detector,
        }
    }

    /// Current dataset snapshot; a fresh empty dataset when nothing has been
    /// stored yet. Never observes a torn document.
    pub fn snapshot(&self) -> Result<Dataset, LedgerError> {
        match self.storage.load(self.config.io_timeout).map_err(lift)? {
            Some((bytes, _)) => Ok(schema::decode_document(&bytes)?),
            None => Ok(Dataset::new(self.config.repo_url.clone())),
        }
    }

    /// Record a run for a tool.
    ///
    /// Idempotent on `commit.id`: a run for an already-recorded commit is a
    /// no-op returning `applied: false`, so CI retries are harmless. Runs
    /// arriving out of date order are inserted at their ordered position
    /// rather than blindly appended.
    pub fn append(&self, tool: &str, run: Run) -> Result<AppendResult, LedgerError> {
        validate(&run)?;

        let timeout = self.config.io_timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (mut dataset, revision) =
                match self.storage.load(timeout).map_err(lift)? {
                    Some((bytes, rev)) => (schema::decode_document(&bytes)?, Some(rev)),
                    None => (Dataset::new(self.config.repo_url.clone()), None),
                };

            let runs = dataset.entries.entry(tool.to_string()).or_default();
            if runs.iter().any(|r| r.commit.id == run.commit.id) {
                debug!(tool, commit = %run.commit.id, "commit already recorded, no-op");
                return Ok(AppendResult { applied: false });
            }

            warn_soft_checks(tool, runs, &run);

            // Stable ordered insert: after the last run dated at or before ours.
            let pos = runs.partition_point(|r| r.date <= run.date);
            runs.insert(pos, run.clone());
            dataset.last_update = dataset.last_update.max(run.date);

            let bytes = schema::encode_document(&dataset, self.config.format)?;
            match self.storage.store(&bytes, revision.as_ref(), timeout) {
                Ok(_) => {
                    debug!(tool, commit = %run.commit.id, attempt, "run appended");
                    return Ok(AppendResult { applied: true });
                }
                Err(StorageError::Conflict) if attempt < self.config.max_attempts => {
                    let delay = backoff_delay(self.config.backoff_base, attempt);
                    warn!(tool, attempt, ?delay, "write conflict, retrying");
                    thread::sleep(delay);
                }
                Err(StorageError::Conflict) => {
                    return Err(LedgerError::ConflictExceeded { attempts: attempt });
                }
                Err(e) => return Err(lift(e)),
            }
        }
    }

    /// Recorded runs for a tool, oldest first. Empty for an unknown tool.
    pub fn history(&self, tool: &str) -> Result<Vec<Run>, LedgerError> {
        let mut dataset = self.snapshot()?;
        Ok(dataset.entries.remove(tool).unwrap_or_default())
    }

    /// Most recent run for a tool.
    pub fn latest(&self, tool: &str) -> Result<Option<Run>, LedgerError> {
        Ok(self.history(tool)?.pop())
    }

    /// Trend of one measurement across a tool's history. The series owns its
    /// snapshot and may be iterated while appends continue.
    pub fn series(&self, tool: &str, name: &str) -> Result<Series, LedgerError> {
        Ok(Series::new(self.history(tool)?, name))
    }

    /// Compare a run against its baseline in the tool's history. Pure read;
    /// callers decide whether the report fails their build.
    pub fn evaluate(&self, tool: &str, run: &Run) -> Result<RegressionReport, LedgerError> {
        let history = self.history(tool)?;
        Ok(self.detector.evaluate(tool, &history, run))
    }
}

/// Soft checks that need history in scope. Logged, never fatal.
fn warn_soft_checks(tool: &str, history: &[Run], run: &Run) {
    if run.commit.parsed_timestamp().is_none() {
        warn!(
            tool,
            commit = %run.commit.id,
            timestamp = %run.commit.timestamp,
            "commit timestamp is not RFC 3339"
        );
    }
    for m in &run.benches {
        let established = history
            .iter()
            .rev()
            .find_map(|r| r.measurement(&m.name).map(|prev| prev.unit.as_str()));
        if let Some(unit) = established {
            if unit != m.unit {
                warn!(
                    tool,
                    name = %m.name,
                    old_unit = unit,
                    new_unit = %m.unit,
                    "measurement unit changed"
                );
            }
        }
    }
}

/// Exponential backoff with random jitter, capped at 64x the base.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
    exp + Duration::from_millis(jitter_ms)
}

fn lift(e: StorageError) -> LedgerError {
    match e {
        StorageError::Timeout(d) => LedgerError::Timeout(d),
        StorageError::Unavailable(e) => LedgerError::Unavailable(e),
        // A load cannot conflict; surfaced here only if a backend misbehaves.
        StorageError::Conflict => LedgerError::ConflictExceeded { attempts: 1 },
    }
}
