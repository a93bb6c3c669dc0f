//! Media library index.
//!
//! The bulk job's stand-in for a real media library: a JSON index at
//! `<image-root>/.library-index.json` listing one record per uploaded image.
//! The first use builds it by scanning the image root; after that the index
//! is the source of truth, the way a CMS's attachment table outlives the
//! files it points at.
//!
//! ## Records
//!
//! A [`MediaRecord`] carries a stable `id`, the currently attached `file`,
//! and the `mime` type of the original upload. The mime never changes — even
//! after [`repoint`](Library::repoint) swaps the attached file for a WebP
//! artifact — so the eligible-record enumeration the bulk job pages through
//! stays stable across a whole job, deletions included.
//!
//! ## Inventory rules
//!
//! The scan picks up JPEG and PNG files only, skips hidden entries, and
//! skips size-variant derivatives (`name-<W>x<H>.ext` files whose base image
//! sits in the same directory) — derivatives belong to their original and
//! are cleaned up with it.

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use walkdir::WalkDir;

/// Name of the index file within the image root.
const INDEX_FILENAME: &str = ".library-index.json";

/// Version of the index format. Bump to force a rescan on format changes.
const INDEX_VERSION: u32 = 1;

/// `name-300x200` style derivative stems.
static VARIANT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<base>.+)-[0-9]+x[0-9]+$").unwrap());

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One image in the library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRecord {
    /// Stable identifier, assigned at scan time.
    pub id: u64,
    /// Currently attached file: relative to the image root, or absolute
    /// once repointed to a cache artifact.
    pub file: String,
    /// Mime type of the original upload. Fixed for the record's lifetime.
    pub mime: String,
}

impl MediaRecord {
    /// Eligible for bulk conversion: the original upload was JPEG or PNG.
    pub fn is_eligible(&self) -> bool {
        matches!(self.mime.as_str(), "image/jpeg" | "image/png")
    }
}

/// On-disk library index.
#[derive(Debug, Serialize, Deserialize)]
pub struct LibraryIndex {
    pub version: u32,
    pub records: Vec<MediaRecord>,
}

impl LibraryIndex {
    /// Count of records the bulk job will enumerate.
    pub fn eligible_total(&self) -> usize {
        self.records.iter().filter(|r| r.is_eligible()).count()
    }

    /// One batch window over the eligible records, in stable id order.
    pub fn fetch(&self, offset: usize, limit: usize) -> Vec<MediaRecord> {
        self.records
            .iter()
            .filter(|r| r.is_eligible())
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    fn record_mut(&mut self, id: u64) -> Option<&mut MediaRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }
}

/// Handle on the image root and its index file.
pub struct Library {
    root: PathBuf,
}

impl Library {
    pub fn open(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }

    /// Load the index, rebuilding it from a filesystem scan when the file
    /// is missing, unparsable, or from another format version.
    pub fn load_or_scan(&self) -> Result<LibraryIndex, LibraryError> {
        if let Ok(content) = fs::read_to_string(self.index_path())
            && let Ok(index) = serde_json::from_str::<LibraryIndex>(&content)
            && index.version == INDEX_VERSION
        {
            return Ok(index);
        }

        let records = self.scan()?;
        debug!("library scan found {} images", records.len());
        let index = LibraryIndex {
            version: INDEX_VERSION,
            records,
        };
        self.save(&index)?;
        Ok(index)
    }

    /// Persist the index (write-temp-then-rename).
    pub fn save(&self, index: &LibraryIndex) -> Result<(), LibraryError> {
        let json = serde_json::to_string_pretty(index)?;
        let path = self.index_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Absolute location of a record's attached file.
    pub fn resolve(&self, record: &MediaRecord) -> PathBuf {
        let file = Path::new(&record.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        }
    }

    /// Point a record's attached file at a new location and persist the
    /// index. Callers delete the old original *before* repointing, so a
    /// failed deletion leaves the original authoritative.
    pub fn repoint(
        &self,
        index: &mut LibraryIndex,
        id: u64,
        new_file: &Path,
    ) -> Result<(), LibraryError> {
        if let Some(record) = index.record_mut(id) {
            record.file = new_file.to_string_lossy().into_owned();
            self.save(index)?;
        }
        Ok(())
    }

    /// Size-variant derivatives of a record's original file: siblings named
    /// `<stem>-<W>x<H>.<ext>`.
    pub fn size_variants(&self, record: &MediaRecord) -> Vec<PathBuf> {
        let original = self.resolve(record);
        let (Some(stem), Some(ext), Some(dir)) = (
            original.file_stem().and_then(|s| s.to_str()),
            original.extension().and_then(|e| e.to_str()),
            original.parent(),
        ) else {
            return Vec::new();
        };

        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut variants: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
                    && p.file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| VARIANT_RE.captures(s))
                        .is_some_and(|caps| &caps["base"] == stem)
            })
            .collect();
        variants.sort();
        variants
    }

    /// Walk the image root for eligible originals in stable path order.
    fn scan(&self) -> Result<Vec<MediaRecord>, LibraryError> {
        let mut files: Vec<(String, &'static str)> = Vec::new();

        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden_name(e.file_name()))
        {
            let entry = entry.map_err(|e| LibraryError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(mime) = mime_for(entry.path()) else {
                continue;
            };
            if is_size_variant(entry.path()) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push((rel, mime));
        }

        files.sort();
        Ok(files
            .into_iter()
            .enumerate()
            .map(|(i, (file, mime))| MediaRecord {
                id: (i + 1) as u64,
                file,
                mime: mime.to_string(),
            })
            .collect())
    }
}

fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Library mime for an inventory candidate; GIFs and everything else are
/// not part of the bulk inventory.
fn mime_for(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("png") => Some("image/png"),
        _ => None,
    }
}

/// A `name-<W>x<H>.ext` file whose base image exists next to it.
fn is_size_variant(path: &Path) -> bool {
    let (Some(stem), Some(ext), Some(dir)) = (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|e| e.to_str()),
        path.parent(),
    ) else {
        return false;
    };
    let Some(caps) = VARIANT_RE.captures(stem) else {
        return false;
    };
    dir.join(format!("{}.{}", &caps["base"], ext)).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "image bytes").unwrap();
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    #[test]
    fn scan_finds_jpeg_and_png_only() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.jpg");
        touch(tmp.path(), "b.png");
        touch(tmp.path(), "c.gif");
        touch(tmp.path(), "d.webp");
        touch(tmp.path(), "notes.txt");

        let index = Library::open(tmp.path().to_path_buf()).load_or_scan().unwrap();
        let files: Vec<&str> = index.records.iter().map(|r| r.file.as_str()).collect();
        assert_eq!(files, vec!["a.jpg", "b.png"]);
        assert_eq!(index.records[0].mime, "image/jpeg");
        assert_eq!(index.records[1].mime, "image/png");
    }

    #[test]
    fn scan_skips_hidden_entries() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "visible.jpg");
        touch(tmp.path(), ".hidden/secret.jpg");
        touch(tmp.path(), ".thumbnail.jpg");

        let index = Library::open(tmp.path().to_path_buf()).load_or_scan().unwrap();
        assert_eq!(index.records.len(), 1);
        assert_eq!(index.records[0].file, "visible.jpg");
    }

    #[test]
    fn scan_skips_size_variants_with_base() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "2024/photo.jpg");
        touch(tmp.path(), "2024/photo-300x200.jpg");
        touch(tmp.path(), "2024/photo-1024x768.jpg");
        // Variant-looking name with no base image is a real upload
        touch(tmp.path(), "2024/banner-640x480.jpg");

        let index = Library::open(tmp.path().to_path_buf()).load_or_scan().unwrap();
        let files: Vec<&str> = index.records.iter().map(|r| r.file.as_str()).collect();
        assert_eq!(files, vec!["2024/banner-640x480.jpg", "2024/photo.jpg"]);
    }

    #[test]
    fn scan_assigns_stable_sequential_ids() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "b.jpg");
        touch(tmp.path(), "a.jpg");
        touch(tmp.path(), "c/d.png");

        let index = Library::open(tmp.path().to_path_buf()).load_or_scan().unwrap();
        let ids: Vec<u64> = index.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // Path-sorted order
        assert_eq!(index.records[0].file, "a.jpg");
        assert_eq!(index.records[1].file, "b.jpg");
        assert_eq!(index.records[2].file, "c/d.png");
    }

    // =========================================================================
    // Index persistence
    // =========================================================================

    #[test]
    fn load_or_scan_persists_and_reloads() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.jpg");
        let library = Library::open(tmp.path().to_path_buf());

        let first = library.load_or_scan().unwrap();
        assert!(library.index_path().exists());

        // New files do not appear until the index is rebuilt; the index,
        // not the filesystem, is the source of truth once it exists.
        touch(tmp.path(), "late-arrival.jpg");
        let second = library.load_or_scan().unwrap();
        assert_eq!(first.records, second.records);
    }

    #[test]
    fn corrupt_index_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.jpg");
        let library = Library::open(tmp.path().to_path_buf());
        fs::write(library.index_path(), "{ not json").unwrap();

        let index = library.load_or_scan().unwrap();
        assert_eq!(index.records.len(), 1);
    }

    #[test]
    fn index_file_is_not_part_of_its_own_inventory() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.jpg");
        let library = Library::open(tmp.path().to_path_buf());
        library.load_or_scan().unwrap();

        // Rescan with the dotfile index present
        fs::remove_file(library.index_path()).unwrap();
        touch(tmp.path(), "b.jpg");
        let index = library.load_or_scan().unwrap();
        assert_eq!(index.records.len(), 2);
    }

    // =========================================================================
    // Fetch windows
    // =========================================================================

    #[test]
    fn fetch_pages_through_eligible_records() {
        let tmp = TempDir::new().unwrap();
        for i in 0..5 {
            touch(tmp.path(), &format!("img-{i}.jpg"));
        }
        let index = Library::open(tmp.path().to_path_buf()).load_or_scan().unwrap();

        assert_eq!(index.eligible_total(), 5);
        let first = index.fetch(0, 2);
        let second = index.fetch(2, 2);
        let last = index.fetch(4, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(last.len(), 1);
        assert_eq!(index.fetch(5, 2).len(), 0);
    }

    // =========================================================================
    // Repointing
    // =========================================================================

    #[test]
    fn repoint_updates_record_and_persists() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.jpg");
        let library = Library::open(tmp.path().to_path_buf());
        let mut index = library.load_or_scan().unwrap();

        let artifact = tmp.path().join("cache/abc.webp");
        library.repoint(&mut index, 1, &artifact).unwrap();

        let reloaded = library.load_or_scan().unwrap();
        assert_eq!(reloaded.records[0].file, artifact.to_string_lossy());
        // Repointed records resolve to the absolute artifact path
        assert_eq!(library.resolve(&reloaded.records[0]), artifact);
        // Mime is fixed, so the record stays in the eligible enumeration
        assert!(reloaded.records[0].is_eligible());
        assert_eq!(reloaded.eligible_total(), 1);
    }

    // =========================================================================
    // Size variants
    // =========================================================================

    #[test]
    fn size_variants_lists_matching_siblings_only() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "photo.jpg");
        touch(tmp.path(), "photo-300x200.jpg");
        touch(tmp.path(), "photo-1024x768.jpg");
        touch(tmp.path(), "photo-300x200.png"); // different extension
        touch(tmp.path(), "other-300x200.jpg"); // different base

        let library = Library::open(tmp.path().to_path_buf());
        let index = library.load_or_scan().unwrap();
        let photo = index
            .records
            .iter()
            .find(|r| r.file == "photo.jpg")
            .unwrap();

        let variants = library.size_variants(photo);
        let names: Vec<String> = variants
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["photo-1024x768.jpg", "photo-300x200.jpg"]);
    }
}
