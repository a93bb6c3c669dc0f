//! Resumable bulk conversion job.
//!
//! Pre-populates the artifact cache by walking the whole library in batches,
//! one batch per [`advance`](BulkJob::advance) call. Invocations are short —
//! each is bounded by the caller-chosen batch size — and progress is
//! persisted between them, so the job survives any number of interruptions
//! and is driven to completion by simply calling `advance` again.
//!
//! # State machine
//!
//! ```text
//! Uninitialized --advance--> Scanning (establishes total)
//! Scanning -----------------> Running (repeated batches)
//! Running --processed==total--> Complete
//! any state --reset----------> Uninitialized
//! ```
//!
//! # Offset discipline
//!
//! Every item outcome — success *or* failure — advances `processed` by
//! exactly one, so the offset for the next batch always moves forward and
//! the job terminates in `ceil(total / batch_size)` invocations no matter
//! how many items fail. Failures are recorded in `errors` instead of
//! stalling the batch.
//!
//! Items are idempotent: an already-cached, fresh image is a cache hit and
//! is not re-encoded, so replaying a batch never repeats work.

use crate::cache::CacheStore;
use crate::library::{Library, LibraryError, LibraryIndex, MediaRecord};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Name of the persisted progress record within the cache root.
const PROGRESS_FILENAME: &str = "progress.json";

/// Recorded error messages are capped; the oldest entries are dropped.
const MAX_RECORDED_ERRORS: usize = 200;

#[derive(Error, Debug)]
pub enum JobError {
    /// The inventory is empty at job start.
    #[error("no images found for conversion")]
    NoImagesFound,
    /// The caller lacks rights to drive bulk operations.
    #[error("unauthorized")]
    Unauthorized,
    #[error("library error: {0}")]
    Library(#[from] LibraryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted job progress.
///
/// `processed` is monotonically non-decreasing for the lifetime of a job;
/// `total` is fixed once the job initializes and only changes via
/// [`BulkJob::reset`]. The job is complete iff `processed == total`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkProgress {
    pub total: usize,
    pub processed: usize,
    pub current_batch: usize,
    pub errors: Vec<String>,
}

impl BulkProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.processed >= self.total
    }

    fn record_error(&mut self, message: String) {
        if self.errors.len() >= MAX_RECORDED_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(message);
    }
}

/// One batch request from the admin boundary.
#[derive(Debug, Clone, Copy)]
pub struct JobRequest {
    pub batch_size: usize,
    pub delete_originals: bool,
}

/// Result of one `advance` call.
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub progress: BulkProgress,
    pub percentage: f64,
    pub remaining: usize,
}

/// Storage for the progress record: a JSON blob under the cache root,
/// replaced atomically (write-temp-then-rename).
struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The stored record, or `None` when absent or unreadable (an
    /// unreadable record restarts the job from the inventory scan).
    fn load(&self) -> Option<BulkProgress> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn save(&self, progress: &BulkProgress) -> Result<(), JobError> {
        let json = serde_json::to_string_pretty(progress)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), JobError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The bulk conversion job over one library and one cache store.
pub struct BulkJob {
    store: Arc<CacheStore>,
    library: Library,
    progress: ProgressStore,
    /// Serializes whole advance calls: the persisted read-modify-write must
    /// be atomic with respect to itself even if two callers race.
    advance_lock: Mutex<()>,
}

impl BulkJob {
    pub fn new(store: Arc<CacheStore>, library: Library, cache_root: PathBuf) -> Self {
        Self {
            store,
            library,
            progress: ProgressStore::new(cache_root.join(PROGRESS_FILENAME)),
            advance_lock: Mutex::new(()),
        }
    }

    /// The current persisted progress, if any.
    pub fn progress(&self) -> Option<BulkProgress> {
        self.progress.load()
    }

    /// Run one batch and persist the updated progress.
    pub fn advance(&self, request: &JobRequest) -> Result<AdvanceOutcome, JobError> {
        let _guard = self.advance_lock.lock();
        let batch_size = request.batch_size.max(1);

        let mut index = self.library.load_or_scan()?;

        // Initialize on first use (or after reset): scan establishes total.
        let mut progress = self.progress.load().unwrap_or_default();
        if progress.total == 0 {
            let total = index.eligible_total();
            if total == 0 {
                return Err(JobError::NoImagesFound);
            }
            progress = BulkProgress {
                total,
                ..BulkProgress::default()
            };
            debug!("bulk job initialized: {total} images");
        }

        let batch = index.fetch(progress.processed, batch_size);
        for record in &batch {
            if let Err(message) = self.process_item(record, request.delete_originals, &mut index) {
                warn!("bulk item failed: {message}");
                progress.record_error(message);
            }
            // Success or failure, the offset moves forward: a failing item
            // must never be refetched at the same offset.
            progress.processed += 1;
        }

        progress.current_batch += 1;
        self.progress.save(&progress)?;

        let percentage = if progress.total > 0 {
            (progress.processed as f64 / progress.total as f64) * 100.0
        } else {
            0.0
        };
        Ok(AdvanceOutcome {
            remaining: progress.total.saturating_sub(progress.processed),
            percentage,
            progress,
        })
    }

    /// Clear the persisted progress record unconditionally.
    pub fn reset(&self) -> Result<(), JobError> {
        let _guard = self.advance_lock.lock();
        self.progress.clear()
    }

    /// Convert one record, optionally replacing the original with the
    /// artifact. Any failure is reported as the item's error string.
    fn process_item(
        &self,
        record: &MediaRecord,
        delete_originals: bool,
        index: &mut LibraryIndex,
    ) -> Result<(), String> {
        let path = self.library.resolve(record);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| record.file.clone());

        if fs::metadata(&path).map(|m| !m.is_file()).unwrap_or(true) {
            return Err(format!("Error converting {name}: file not accessible"));
        }

        let artifact = self
            .store
            .get_or_create(&record.file)
            .map_err(|e| format!("Error converting {name}: {e}"))?;

        if delete_originals {
            self.delete_original(record, &path, &artifact, index)
                .map_err(|e| format!("Error converting {name}: {e}"))?;
        }
        Ok(())
    }

    /// Replace the original with its artifact.
    ///
    /// Ordering contract: the original is deleted first and the library
    /// record repointed only afterwards, so a failed delete leaves the
    /// original authoritative. Orphaned size variants go last; their
    /// removal is best-effort.
    fn delete_original(
        &self,
        record: &MediaRecord,
        original: &std::path::Path,
        artifact: &std::path::Path,
        index: &mut LibraryIndex,
    ) -> Result<(), String> {
        let artifact_len = fs::metadata(artifact).map(|m| m.len()).unwrap_or(0);
        if artifact_len == 0 {
            return Err("WebP version missing or empty before deletion".to_string());
        }

        fs::remove_file(original).map_err(|e| format!("failed to delete original file: {e}"))?;

        self.library
            .repoint(index, record.id, artifact)
            .map_err(|e| format!("failed to update library record: {e}"))?;

        for variant in self.library.size_variants(record) {
            let _ = fs::remove_file(variant);
        }
        Ok(())
    }
}
