//! # webp-relay
//!
//! Transparent WebP conversion, caching, and delivery for an existing image
//! library. Capable clients transparently receive cached WebP artifacts in
//! place of JPEG/PNG/GIF originals — via direct image-request interception
//! and via `<picture>` rewriting of outgoing HTML — while a resumable bulk
//! job pre-populates the cache across the whole library.
//!
//! # Architecture
//!
//! ```text
//! request ──> capability ──┬──> interceptor ──> cache ──> convert
//!                          └──> rewriter ─────> cache (read-only)
//! bulk batch ─────────────────> library ──────> cache ──> convert
//! ```
//!
//! The capability detector feeds both the interceptor and the rewriter. The
//! interceptor and the bulk job drive the cache store, which drives the
//! conversion engine. The rewriter only ever reads cache existence so page
//! rendering latency stays bounded.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`capability`] | Classifies clients as WebP-capable from request headers, memoized per session |
//! | [`convert`] | Decodes a source, selects a quality, encodes WebP, validates, commits atomically |
//! | [`cache`] | Digest-keyed artifact store with mtime freshness and single-flight conversions |
//! | [`serve`] | HTTP server: interception with ETag/304 handling, static passthrough, admin endpoints |
//! | [`rewrite`] | `<img>` → `<picture>` rewriting over outgoing HTML documents |
//! | [`library`] | Media-library index the bulk job enumerates, with record repointing |
//! | [`bulk`] | Resumable batch job that pre-populates the cache and persists its progress |
//! | [`config`] | `webp-relay.toml` loading, validation, and the stock config printer |
//!
//! # Design Decisions
//!
//! ## Never serve a WebP that is not a win
//!
//! The engine rejects any conversion whose output is not strictly smaller
//! than its source. A rejected conversion is not an outage: the interceptor
//! and the rewriter silently fall back to the original asset, so the worst
//! case is exactly the site as it was without webp-relay.
//!
//! ## Digest-keyed flat cache
//!
//! Artifacts live flat under the cache root as `<key>.webp`, where the key
//! is the SHA-256 of the source's path relative to the image root. Every
//! component — interceptor, rewriter, bulk job — derives the same key from
//! the same logical path, and freshness is a single mtime comparison against
//! the source.
//!
//! ## Single-flight conversions
//!
//! Concurrent requests for the same missing artifact would each burn a full
//! decode/encode cycle. The cache store serializes conversions per key
//! behind an in-memory lock table and re-checks freshness under the lock,
//! so duplicate requests converge on one conversion's result. Distinct keys
//! never contend.
//!
//! ## Resumable bulk conversion
//!
//! A whole-library conversion cannot assume it survives a single invocation,
//! so the bulk job is a state machine over a persisted progress record: each
//! invocation converts one bounded batch, advances the offset by every item
//! outcome (failures included — a bad image must never stall the job), and
//! persists before returning. Stopping is always safe; the next invocation
//! resumes where the last one ended.

pub mod bulk;
pub mod cache;
pub mod capability;
pub mod config;
pub mod convert;
pub mod library;
pub mod rewrite;
pub mod serve;
