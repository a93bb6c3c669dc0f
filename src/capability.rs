//! Client WebP capability detection.
//!
//! Classifies a requester as WebP-capable or not from its request headers,
//! memoized per client session so header parsing happens once per session.
//!
//! Detection order (first positive signal wins):
//!
//! 1. `Accept` header advertising `image/webp`
//! 2. User-Agent heuristics for browsers that predate the Accept signal:
//!    Chrome >= 32, Opera >= 19, Android >= 4.2
//!
//! Absent or malformed headers degrade to "not capable" — there are no error
//! conditions on this path, only a conservative `false`.
//!
//! The capability value is threaded explicitly: callers pass a [`Session`]
//! (or go through a [`SessionTable`] keyed by client IP in the server) rather
//! than reading any process-wide state.

use log::debug;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Minimum Chrome major version with WebP support.
const MIN_CHROME: u32 = 32;
/// Minimum Opera major version with WebP support.
const MIN_OPERA: u32 = 19;
/// Minimum Android (major, minor) with WebP support.
const MIN_ANDROID: (u32, u32) = (4, 2);

static CHROME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Chrome/([0-9]+)").unwrap());
static OPERA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Opera/([0-9]+)\.[0-9]+").unwrap());
static ANDROID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Android ([0-9]+)\.([0-9]+)").unwrap());

/// The request headers capability detection looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestHeaders<'a> {
    pub accept: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Per-client session state. Holds the memoized capability value; not
/// persisted beyond the session lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Session {
    webp_support: Option<bool>,
}

impl Session {
    /// A session primed with a known capability value (tests, trusted
    /// upstream detection).
    pub fn with_capability(value: bool) -> Self {
        Self {
            webp_support: Some(value),
        }
    }
}

/// Whether the client can use WebP, memoized in the session.
///
/// A cached value is returned without re-parsing headers. On computation
/// (not on a cache hit) the result is written back into the session.
pub fn accepts(headers: &RequestHeaders, session: &mut Session) -> bool {
    if let Some(cached) = session.webp_support {
        return cached;
    }
    let result = detect(headers);
    session.webp_support = Some(result);
    debug!(
        "WebP support: {} (Accept: {}, UA: {})",
        result,
        headers.accept.unwrap_or("not set"),
        headers.user_agent.unwrap_or("not set"),
    );
    result
}

/// Header inspection without memoization.
fn detect(headers: &RequestHeaders) -> bool {
    if let Some(accept) = headers.accept
        && accept.contains("image/webp")
    {
        return true;
    }

    let Some(ua) = headers.user_agent else {
        return false;
    };
    if let Some(caps) = CHROME_RE.captures(ua) {
        return parse_u32(&caps[1]) >= MIN_CHROME;
    }
    if let Some(caps) = OPERA_RE.captures(ua) {
        return parse_u32(&caps[1]) >= MIN_OPERA;
    }
    if let Some(caps) = ANDROID_RE.captures(ua) {
        return (parse_u32(&caps[1]), parse_u32(&caps[2])) >= MIN_ANDROID;
    }
    false
}

/// The capture is all digits; overflow of a version number yields 0 (not
/// capable) rather than a panic.
fn parse_u32(digits: &str) -> u32 {
    digits.parse().unwrap_or(0)
}

/// Session store keyed by client IP.
///
/// The server's rendition of per-session memoization: requests from the same
/// address reuse one [`Session`], so headers are parsed once per client.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<IpAddr, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability for the given client, memoized in its session. Requests
    /// with no resolvable address are detected without memoization.
    pub fn accepts(&self, client: Option<IpAddr>, headers: &RequestHeaders) -> bool {
        match client {
            Some(ip) => {
                let mut sessions = self.inner.lock();
                let session = sessions.entry(ip).or_default();
                accepts(headers, session)
            }
            None => accepts(headers, &mut Session::default()),
        }
    }
}
