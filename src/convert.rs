//! WebP conversion engine.
//!
//! One conversion attempt walks the stages
//! `Decoding -> Encoding -> Validating -> Committing -> Done`; any stage can
//! fail, and the engine never retries — retry policy belongs to callers.
//!
//! | Stage | What happens |
//! |---|---|
//! | Decoding | format sniff + decode to RGBA via the `image` crate |
//! | Encoding | lossy WebP at the policy-selected quality, written to `<dest>.tmp` |
//! | Validating | artifact must be strictly smaller than the source |
//! | Committing | atomic rename onto the final path, permissions 0644 |
//!
//! The temporary artifact is removed on every failure path, so a partial
//! write is never visible under the final name.
//!
//! ## Quality policy
//!
//! JPEG and GIF sources encode at the configured default quality. PNG sources
//! use the lower high-compression quality to bound output size given the
//! extra alpha channel cost. Any source whose file size exceeds the
//! configured threshold is forced to the high-compression quality regardless
//! of type.
//!
//! PNG decoding expands palette images to direct color and keeps the alpha
//! channel end-to-end; losing transparency is a correctness bug, not an
//! acceptable simplification. GIF sources decode their first frame.

use image::{ImageFormat, ImageReader};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    /// The source could not be identified or decoded as JPEG, PNG, or GIF.
    #[error("invalid image: {0}")]
    InvalidImage(String),
    /// The encoded WebP was not strictly smaller than the source.
    #[error("WebP output not smaller than source ({webp} >= {} bytes)", r#source)]
    NoSizeBenefit { webp: u64, r#source: u64 },
    /// The temporary artifact could not be moved onto the final path.
    #[error("failed to commit artifact: {0}")]
    CommitFailed(std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Quality setting for lossy WebP encoding (1-100). Clamped on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(80)
    }
}

/// Source image type accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Jpeg,
    Png,
    Gif,
}

impl SourceFormat {
    fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Gif => Some(Self::Gif),
            _ => None,
        }
    }
}

/// Quality selection policy for the engine.
///
/// See the [module docs](self) for the rules. Values come from the
/// `[conversion]` config table.
#[derive(Debug, Clone)]
pub struct QualityPolicy {
    pub default_quality: Quality,
    pub high_compression_quality: Quality,
    pub size_threshold: u64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            default_quality: Quality::new(80),
            high_compression_quality: Quality::new(60),
            size_threshold: 100 * 1024,
        }
    }
}

impl QualityPolicy {
    /// Select the encoding quality for a source of the given type and size.
    pub fn select(&self, format: SourceFormat, source_len: u64) -> Quality {
        if source_len > self.size_threshold {
            return self.high_compression_quality;
        }
        match format {
            SourceFormat::Png => self.high_compression_quality,
            SourceFormat::Jpeg | SourceFormat::Gif => self.default_quality,
        }
    }
}

/// Summary of a successful conversion.
#[derive(Debug, Clone, Copy)]
pub struct Conversion {
    pub quality: Quality,
    pub source_len: u64,
    pub artifact_len: u64,
}

impl Conversion {
    /// Bytes saved relative to the source. Always positive: a conversion
    /// that saves nothing fails with [`ConvertError::NoSizeBenefit`].
    pub fn bytes_saved(&self) -> u64 {
        self.source_len - self.artifact_len
    }
}

/// Temporary artifact that cleans itself up unless committed.
struct TempArtifact {
    path: PathBuf,
    committed: bool,
}

impl TempArtifact {
    fn for_dest(dest: &Path) -> Self {
        Self {
            path: dest.with_extension("webp.tmp"),
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the temporary file onto the final path.
    fn commit(mut self, dest: &Path) -> Result<(), ConvertError> {
        fs::rename(&self.path, dest).map_err(ConvertError::CommitFailed)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Convert `source` to a WebP artifact at `dest`.
///
/// The destination directory is created if needed. On success the artifact
/// is world-readable (0644 on Unix) and strictly smaller than the source;
/// on failure nothing is left at `dest` or the temporary path.
pub fn convert(
    source: &Path,
    dest: &Path,
    policy: &QualityPolicy,
) -> Result<Conversion, ConvertError> {
    let source_len = fs::metadata(source)?.len();

    // Decoding
    let reader = ImageReader::open(source)?.with_guessed_format()?;
    let format = reader
        .format()
        .and_then(SourceFormat::from_image_format)
        .ok_or_else(|| {
            ConvertError::InvalidImage(format!("unsupported format: {}", source.display()))
        })?;
    let img = reader.decode().map_err(|e| {
        ConvertError::InvalidImage(format!("failed to decode {}: {}", source.display(), e))
    })?;
    // Direct-color RGBA: paletted PNGs are expanded and alpha is preserved.
    let rgba = img.to_rgba8();

    // Encoding
    let quality = policy.select(format, source_len);
    let encoded =
        webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
            .encode(quality.value() as f32);
    let artifact_len = encoded.len() as u64;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = TempArtifact::for_dest(dest);
    fs::write(tmp.path(), &*encoded)?;

    // Validating: never serve a WebP that is not a win.
    if artifact_len >= source_len {
        return Err(ConvertError::NoSizeBenefit {
            webp: artifact_len,
            r#source: source_len,
        });
    }

    // Committing
    tmp.commit(dest)?;
    // Best-effort: the artifact is already committed and servable.
    let _ = set_artifact_permissions(dest);

    debug!(
        "converted {} -> {} (quality {}, {} -> {} bytes)",
        source.display(),
        dest.display(),
        quality.value(),
        source_len,
        artifact_len
    );

    Ok(Conversion {
        quality,
        source_len,
        artifact_len,
    })
}

/// World-readable, owner-writable.
#[cfg(unix)]
fn set_artifact_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_artifact_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
