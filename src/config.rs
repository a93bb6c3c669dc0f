//! Relay configuration module.
//!
//! Handles loading and validating `webp-relay.toml`. All options have stock
//! defaults; a config file only needs to specify the values it overrides, and
//! unknown keys are rejected to catch typos early.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [conversion]
//! quality = 80                  # WebP quality for JPEG/GIF sources (1-100)
//! high_compression_quality = 60 # Quality for PNG and oversized sources (1-100)
//! size_threshold = 102400       # Sources above this many bytes are forced
//!                               # to the high-compression quality
//!
//! [paths]
//! image_root = "uploads"        # Root of the managed image library
//! cache_root = "cache/webp"     # Where converted artifacts are stored
//!
//! [urls]
//! upload_base = "/uploads"      # Public URL prefix of the image library
//! cache_base = "/cache/webp"    # Public URL prefix of cached artifacts
//!
//! [serve]
//! interface = "127.0.0.1"
//! port = 8080
//! web_root = "."                # Static files served outside the image root
//! admin_prefix = "/admin"       # URL prefix treated as an admin context
//! # admin_token = "..."         # Bearer token for the bulk/reset endpoints;
//!                               # endpoints are disabled when unset
//! ```
//!
//! ## Quality Policy
//!
//! The two `[conversion]` tunables drive the engine's quality selection:
//! JPEG and GIF sources encode at `quality`, PNG sources at
//! `high_compression_quality` (the alpha channel is expensive), and any
//! source larger than `size_threshold` bytes is forced to the
//! high-compression quality regardless of type.

use crate::convert::{Quality, QualityPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Relay configuration loaded from `webp-relay.toml`.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Encoding quality and size-threshold policy.
    pub conversion: ConversionConfig,
    /// Filesystem roots for the image library and the artifact cache.
    pub paths: PathsConfig,
    /// Public URL prefixes used by the interceptor and the HTML rewriter.
    pub urls: UrlsConfig,
    /// HTTP server settings.
    pub serve: ServeConfig,
}

impl RelayConfig {
    /// Load from a TOML file, falling back to stock defaults when the file
    /// does not exist. Parse errors and invalid values are reported.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.conversion.quality) {
            return Err(ConfigError::Validation(
                "conversion.quality must be 1-100".into(),
            ));
        }
        if !(1..=100).contains(&self.conversion.high_compression_quality) {
            return Err(ConfigError::Validation(
                "conversion.high_compression_quality must be 1-100".into(),
            ));
        }
        if self.conversion.size_threshold == 0 {
            return Err(ConfigError::Validation(
                "conversion.size_threshold must be non-zero".into(),
            ));
        }
        if !self.urls.upload_base.starts_with('/') {
            return Err(ConfigError::Validation(
                "urls.upload_base must start with '/'".into(),
            ));
        }
        if !self.urls.cache_base.starts_with('/') {
            return Err(ConfigError::Validation(
                "urls.cache_base must start with '/'".into(),
            ));
        }
        Ok(())
    }

    /// Build the engine's quality policy from the `[conversion]` table.
    pub fn quality_policy(&self) -> QualityPolicy {
        QualityPolicy {
            default_quality: Quality::new(self.conversion.quality),
            high_compression_quality: Quality::new(self.conversion.high_compression_quality),
            size_threshold: self.conversion.size_threshold,
        }
    }
}

/// Encoding quality and size-threshold policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversionConfig {
    /// WebP quality for JPEG and GIF sources (1-100).
    pub quality: u32,
    /// WebP quality for PNG sources and oversized sources (1-100).
    pub high_compression_quality: u32,
    /// Sources larger than this many bytes are forced to the
    /// high-compression quality regardless of type.
    pub size_threshold: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            quality: 80,
            high_compression_quality: 60,
            size_threshold: 100 * 1024,
        }
    }
}

/// Filesystem roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Root directory of the managed image library.
    pub image_root: PathBuf,
    /// Directory holding converted artifacts, one `<key>.webp` per cache key.
    pub cache_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            image_root: PathBuf::from("uploads"),
            cache_root: PathBuf::from("cache/webp"),
        }
    }
}

/// Public URL prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UrlsConfig {
    /// URL prefix under which the image library is served.
    pub upload_base: String,
    /// URL prefix under which cached artifacts are served.
    pub cache_base: String,
}

impl Default for UrlsConfig {
    fn default() -> Self {
        Self {
            upload_base: "/uploads".to_string(),
            cache_base: "/cache/webp".to_string(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeConfig {
    /// Interface to bind.
    pub interface: String,
    /// Port to bind.
    pub port: u16,
    /// Root for static files outside the image library.
    pub web_root: PathBuf,
    /// URL prefix treated as an administrative context (never rewritten,
    /// hosts the bulk/reset endpoints).
    pub admin_prefix: String,
    /// Bearer token required by the bulk/reset endpoints. When unset the
    /// endpoints are disabled entirely.
    pub admin_token: Option<String>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            interface: "127.0.0.1".to_string(),
            port: 8080,
            web_root: PathBuf::from("."),
            admin_prefix: "/admin".to_string(),
            admin_token: None,
        }
    }
}

/// A documented stock `webp-relay.toml` with every option at its default.
pub fn stock_config_toml() -> String {
    r#"# webp-relay configuration. Every option is optional; the values below
# are the stock defaults.

[conversion]
# WebP quality for JPEG and GIF sources (1-100).
quality = 80
# Quality for PNG sources (the alpha channel is expensive) and for any
# source larger than size_threshold.
high_compression_quality = 60
# Sources above this many bytes are forced to high_compression_quality.
size_threshold = 102400

[paths]
# Root of the managed image library.
image_root = "uploads"
# Where converted artifacts are stored, one <key>.webp per cache key.
cache_root = "cache/webp"

[urls]
# Public URL prefix of the image library.
upload_base = "/uploads"
# Public URL prefix of cached artifacts.
cache_base = "/cache/webp"

[serve]
interface = "127.0.0.1"
port = 8080
# Static files served outside the image root.
web_root = "."
# URL prefix treated as an admin context.
admin_prefix = "/admin"
# Bearer token for the bulk/reset endpoints; leave unset to disable them.
# admin_token = "change-me"
"#
    .to_string()
}
