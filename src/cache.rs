//! On-disk WebP artifact cache.
//!
//! Maps a stable key derived from a source image's logical path to a WebP
//! artifact on disk, converting on demand through the
//! [engine](crate::convert).
//!
//! # Design
//!
//! ## Cache keys
//!
//! The cache is keyed by the **logical path** — the source's path relative to
//! the image root, with `/` separators. The key is the SHA-256 hex digest of
//! that string: identical logical paths always yield identical keys, distinct
//! paths yield distinct keys with overwhelming probability, and renaming the
//! image root or moving the cache directory never invalidates anything.
//!
//! Artifacts live flat under the cache root, one `<key>.webp` per key.
//!
//! ## Freshness
//!
//! An artifact's own modification time is the recorded conversion-time
//! marker: the artifact is fresh iff its mtime is at least the source's
//! current mtime. Touching the source makes the next
//! [`get_or_create`](CacheStore::get_or_create) regenerate the artifact.
//!
//! ## Single-flight conversions
//!
//! At most one conversion runs per cache key at any time. Concurrent
//! requests for the same stale or missing key serialize on a per-key lock
//! and re-check freshness once they hold it, so all but the first converge
//! on the winner's artifact instead of redundantly re-encoding. Guards are
//! RAII and release on every exit path, including conversion failures.
//! Distinct keys convert concurrently with no coordination.

use crate::convert::{self, ConvertError, QualityPolicy};
use log::debug;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The source image does not exist or cannot be read.
    #[error("source not accessible: {0}")]
    SourceAccess(PathBuf),
    /// Conversion failed; the caller falls back to the original asset.
    #[error("conversion unavailable: {0}")]
    Unavailable(#[from] ConvertError),
}

/// Deterministic digest identifying a source image's cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a logical path (path relative to the image root). Leading
    /// slashes and platform separators are normalized so every caller
    /// derives the same key for the same image.
    pub fn for_logical_path(logical: &str) -> Self {
        let normalized = logical.trim_start_matches('/').replace('\\', "/");
        let digest = Sha256::digest(normalized.as_bytes());
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-key mutual exclusion table.
///
/// Lock entries are created on demand and dropped again when the last
/// holder releases, so the table only ever holds in-flight keys.
#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

struct KeyGuard<'a> {
    table: &'a KeyLocks,
    key: String,
    _held: ArcMutexGuard<RawMutex, ()>,
}

impl KeyLocks {
    /// Block until this key's lock is held.
    fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let slot = {
            let mut map = self.inner.lock();
            Arc::clone(map.entry(key.as_str().to_string()).or_default())
        };
        let held = slot.lock_arc();
        KeyGuard {
            table: self,
            key: key.as_str().to_string(),
            _held: held,
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.table.inner.lock();
        // Strong count 2 = the map's Arc plus the one inside our guard:
        // nobody else is waiting, so the entry can go.
        let unused = map
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2);
        if unused {
            map.remove(&self.key);
        }
    }
}

/// The artifact cache: resolves logical paths to on-disk WebP artifacts,
/// converting on demand.
pub struct CacheStore {
    image_root: PathBuf,
    cache_root: PathBuf,
    policy: QualityPolicy,
    locks: KeyLocks,
}

impl CacheStore {
    /// Open a store over the given roots, creating the cache directory if
    /// needed.
    pub fn open(
        image_root: PathBuf,
        cache_root: PathBuf,
        policy: QualityPolicy,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(&cache_root)?;
        Ok(Self {
            image_root,
            cache_root,
            policy,
            locks: KeyLocks::default(),
        })
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }

    /// On-disk location for a key's artifact (whether or not it exists).
    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_root.join(format!("{key}.webp"))
    }

    /// Read-only probe: the artifact path if one already exists for this
    /// logical path. Never triggers a conversion and ignores freshness —
    /// this is the rewriter's latency-bounded existence check.
    pub fn lookup(&self, logical: &str) -> Option<PathBuf> {
        let path = self.artifact_path(&CacheKey::for_logical_path(logical));
        path.is_file().then_some(path)
    }

    /// The artifact for a logical path, converting if it is missing or
    /// stale. Returns the artifact path on success; any failure means the
    /// caller serves the original asset instead.
    pub fn get_or_create(&self, logical: &str) -> Result<PathBuf, CacheError> {
        let key = CacheKey::for_logical_path(logical);
        let source = self.image_root.join(logical.trim_start_matches('/'));
        let source_mtime = fs::metadata(&source)
            .and_then(|m| m.modified())
            .map_err(|_| CacheError::SourceAccess(source.clone()))?;

        let artifact = self.artifact_path(&key);
        if is_fresh(&artifact, source_mtime) {
            return Ok(artifact);
        }

        let _guard = self.locks.lock(&key);
        // Another request may have finished the conversion while we waited.
        if is_fresh(&artifact, source_mtime) {
            debug!("coalesced conversion for {logical}");
            return Ok(artifact);
        }

        convert::convert(&source, &artifact, &self.policy)?;
        Ok(artifact)
    }
}

/// Fresh iff the artifact exists and its mtime is at least the source's.
fn is_fresh(artifact: &Path, source_mtime: std::time::SystemTime) -> bool {
    fs::metadata(artifact)
        .and_then(|m| m.modified())
        .map(|artifact_mtime| artifact_mtime >= source_mtime)
        .unwrap_or(false)
}
