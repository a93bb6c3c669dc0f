//! Outgoing HTML rewriting.
//!
//! Scans a rendered HTML document for `<img>` tags whose `src` points at a
//! convertible upload and wraps each one in a capability-negotiated
//! `<picture>` element exposing the cached WebP artifact as the preferred
//! source:
//!
//! ```text
//! <img class="hero" src="/uploads/2024/photo.jpg" alt="x">
//! ```
//!
//! becomes
//!
//! ```text
//! <picture><source srcset="/cache/webp/<key>.webp" type="image/webp"><img
//! class="hero" src="/uploads/2024/photo.jpg" alt="x"></picture>
//! ```
//!
//! This is a structural transform, not a content transform: every attribute
//! of the original tag survives verbatim, in its original order, as the
//! fallback image.
//!
//! The rewriter only ever *reads* cache existence — it never triggers a
//! conversion, keeping page rendering latency bounded. Tags whose artifact
//! is absent are left untouched, so the transform is idempotent on documents
//! with nothing to do, and no match shape can fail the response.

use crate::cache::{CacheKey, CacheStore};
use crate::config::RelayConfig;
use log::debug;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;

/// Full-document gate: an opening `<html>` tag anywhere in the response.
static HTML_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<html[^>]*>").unwrap());

/// Where a response is being rendered, and for whom.
///
/// Rewriting applies only to ordinary page renders for WebP-capable
/// clients; administrative screens, AJAX responses, and scheduled-task
/// output pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderContext {
    pub webp_capable: bool,
    pub admin: bool,
    pub ajax: bool,
    pub scheduled: bool,
}

impl RenderContext {
    /// An ordinary page render for a capable client.
    pub fn for_capable_page() -> Self {
        Self {
            webp_capable: true,
            ..Self::default()
        }
    }

    fn should_rewrite(&self) -> bool {
        self.webp_capable && !self.admin && !self.ajax && !self.scheduled
    }
}

/// Rewrites outgoing HTML against one cache store.
pub struct Rewriter {
    store: Arc<CacheStore>,
    img_re: Regex,
    upload_base: String,
    cache_base: String,
}

impl Rewriter {
    pub fn new(config: &RelayConfig, store: Arc<CacheStore>) -> Self {
        let upload_base = config.urls.upload_base.trim_end_matches('/').to_string();
        // Capture groups: 1 = attrs before src, 2 = opening quote, 3 = src
        // URL, 4 = closing quote, 5 = attrs after src.
        let pattern = format!(
            r#"(?i)<img([^>]+)src=(['"])({}/[^"']+\.(?:jpe?g|png|gif))(['"])([^>]*)>"#,
            regex::escape(&upload_base),
        );
        let img_re = Regex::new(&pattern).expect("image tag pattern");
        Self {
            store,
            img_re,
            upload_base,
            cache_base: config.urls.cache_base.trim_end_matches('/').to_string(),
        }
    }

    /// Rewrite a response body. Returns the input unchanged unless the
    /// context allows rewriting, the body is a full HTML document, and at
    /// least one matching tag has a cached artifact.
    pub fn rewrite<'a>(&self, html: &'a str, context: &RenderContext) -> Cow<'a, str> {
        if !context.should_rewrite() || !HTML_OPEN_RE.is_match(html) {
            return Cow::Borrowed(html);
        }

        let started = Instant::now();
        let rewritten = self.img_re.replace_all(html, |caps: &Captures| {
            match self.webp_url_for(&caps[3]) {
                Some(webp_url) => format!(
                    "<picture><source srcset=\"{}\" type=\"image/webp\"><img{}src={}{}{}{}></picture>",
                    webp_url, &caps[1], &caps[2], &caps[3], &caps[4], &caps[5],
                ),
                // No artifact yet: leave the tag exactly as it was.
                None => caps[0].to_string(),
            }
        });
        debug!("HTML rewrite completed in {:?}", started.elapsed());
        rewritten
    }

    /// Public URL of the cached artifact for an upload URL, if the artifact
    /// already exists. Read-only; never converts.
    fn webp_url_for(&self, src: &str) -> Option<String> {
        let logical = src.strip_prefix(&self.upload_base)?;
        self.store.lookup(logical)?;
        let key = CacheKey::for_logical_path(logical);
        Some(format!("{}/{}.webp", self.cache_base, key))
    }
}
