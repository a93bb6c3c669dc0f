//! HTTP server: image interception, static serving, admin endpoints.
//!
//! Every inbound request is classified once:
//!
//! 1. **Admin endpoints** — `POST <admin-prefix>/bulk` and
//!    `POST <admin-prefix>/reset`, bearer-token guarded, drive the
//!    [bulk job](crate::bulk) one batch at a time.
//! 2. **Image interception** — direct requests for JPEG/PNG/GIF files under
//!    the upload base URL. Capable clients get the cached WebP artifact with
//!    long-lived caching headers and ETag/304 conditional handling; anything
//!    else (incapable client, missing source, failed conversion) falls
//!    through to ordinary static serving of the original bytes.
//! 3. **Static passthrough** — everything else is served from the web root
//!    (or the image root for upload-prefixed paths). HTML documents are run
//!    through the [rewriter](crate::rewrite) on the way out.
//!
//! Requests are handled on a small rayon pool so an on-demand conversion
//! never blocks unrelated requests.

use crate::bulk::{BulkJob, JobError, JobRequest};
use crate::cache::CacheStore;
use crate::capability::{RequestHeaders, SessionTable};
use crate::config::RelayConfig;
use crate::library::Library;
use crate::rewrite::{RenderContext, Rewriter};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

/// Batch size used when the admin request does not specify one.
const DEFAULT_BATCH_SIZE: usize = 20;

/// Public cache lifetime for served artifacts: one year.
const CACHE_CONTROL: &str = "public, max-age=31536000";

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, String),
    #[error("request pool error: {0}")]
    Pool(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shared per-server state: config, cache store, rewriter, sessions, job.
pub struct RelayContext {
    config: RelayConfig,
    store: Arc<CacheStore>,
    rewriter: Rewriter,
    sessions: SessionTable,
    job: BulkJob,
    upload_re: Regex,
}

impl RelayContext {
    pub fn new(config: RelayConfig) -> Result<Self, ServeError> {
        let store = Arc::new(CacheStore::open(
            config.paths.image_root.clone(),
            config.paths.cache_root.clone(),
            config.quality_policy(),
        )?);
        let rewriter = Rewriter::new(&config, Arc::clone(&store));
        let job = BulkJob::new(
            Arc::clone(&store),
            Library::open(config.paths.image_root.clone()),
            config.paths.cache_root.clone(),
        );
        let upload_re = upload_pattern(&config.urls.upload_base);
        Ok(Self {
            config,
            store,
            rewriter,
            sessions: SessionTable::new(),
            job,
            upload_re,
        })
    }
}

/// Bound server ready to accept requests.
pub struct BoundServer {
    server: Server,
    addr: SocketAddr,
    context: Arc<RelayContext>,
}

/// Bind the HTTP server without starting the request loop.
pub fn bind(config: RelayConfig) -> Result<BoundServer, ServeError> {
    let bind_addr = format!("{}:{}", config.serve.interface, config.serve.port);
    let server = Server::http(&bind_addr)
        .map_err(|e| ServeError::Bind(bind_addr.clone(), e.to_string()))?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| ServeError::Bind(bind_addr.clone(), "no ip address".to_string()))?;
    let context = Arc::new(RelayContext::new(config)?);
    info!("serving on http://{addr}");
    Ok(BoundServer {
        server,
        addr,
        context,
    })
}

impl BoundServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the request loop (blocking).
    ///
    /// Requests are dispatched onto a small thread pool so an on-demand
    /// conversion cannot block other requests.
    pub fn run(self) -> Result<(), ServeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .map_err(|e| ServeError::Pool(e.to_string()))?;

        for request in self.server.incoming_requests() {
            let context = Arc::clone(&self.context);
            pool.spawn(move || {
                if let Err(e) = handle_request(request, &context) {
                    warn!("request error: {e}");
                }
            });
        }
        Ok(())
    }
}

/// Classify and answer a single request.
fn handle_request(request: Request, ctx: &RelayContext) -> Result<(), ServeError> {
    let url = request.url();
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (url.to_string(), String::new()),
    };

    // Admin boundary (only routed when a token is configured)
    if ctx.config.serve.admin_token.is_some() {
        let prefix = ctx.config.serve.admin_prefix.trim_end_matches('/');
        if path == format!("{prefix}/bulk") {
            return handle_bulk(request, ctx, &query);
        }
        if path == format!("{prefix}/reset") {
            return handle_reset(request, ctx);
        }
    }

    let capable = client_accepts_webp(&request, ctx);

    // Image interception
    if let Some(logical) = match_upload(&ctx.upload_re, &path) {
        let source = safe_join(ctx.store.image_root(), &logical);
        if capable && source.as_deref().is_some_and(Path::is_file) {
            match ctx.store.get_or_create(&logical) {
                Ok(artifact) => return serve_artifact(request, &artifact),
                // Conversion trouble never breaks the page: fall back to
                // the original asset below.
                Err(e) => debug!("falling back to original for {logical}: {e}"),
            }
        }
    }

    serve_static(request, ctx, &path, capable)
}

// =============================================================================
// Artifact serving
// =============================================================================

/// Serve a cached artifact with long-lived caching headers, honoring
/// `If-None-Match`.
fn serve_artifact(request: Request, artifact: &Path) -> Result<(), ServeError> {
    let body = fs::read(artifact)?;
    let etag = etag_for(&body);

    if let Some(condition) = header_value(&request, "if-none-match")
        && not_modified(condition, &etag)
    {
        let response = Response::empty(StatusCode(304))
            .with_header(make_header("ETag", &etag))
            .with_header(make_header("Vary", "Accept"));
        request.respond(response)?;
        return Ok(());
    }

    let response = Response::from_data(body)
        .with_header(make_header("Content-Type", "image/webp"))
        .with_header(make_header("Cache-Control", CACHE_CONTROL))
        .with_header(make_header("ETag", &etag))
        .with_header(make_header("Vary", "Accept"));
    request.respond(response)?;
    Ok(())
}

/// Strong validator: quoted SHA-256 of the artifact bytes.
fn etag_for(body: &[u8]) -> String {
    format!("\"{:x}\"", Sha256::digest(body))
}

/// Conditional match for `If-None-Match` against the current ETag.
fn not_modified(condition: &str, etag: &str) -> bool {
    condition.trim() == etag
}

// =============================================================================
// Static passthrough
// =============================================================================

/// Serve a file from the web root (or image root for upload paths),
/// rewriting outgoing HTML documents.
fn serve_static(
    request: Request,
    ctx: &RelayContext,
    path: &str,
    capable: bool,
) -> Result<(), ServeError> {
    let Some(file) = resolve_static(ctx, path).filter(|p| p.is_file()) else {
        let response = Response::from_string("404 Not Found")
            .with_status_code(StatusCode(404))
            .with_header(make_header("Content-Type", "text/plain"));
        request.respond(response)?;
        return Ok(());
    };

    let content_type = content_type_for(&file);
    if content_type == "text/html" {
        let bytes = fs::read(&file)?;
        let html = String::from_utf8_lossy(&bytes);
        let context = RenderContext {
            webp_capable: capable,
            admin: path.starts_with(ctx.config.serve.admin_prefix.trim_end_matches('/')),
            ajax: is_ajax(&request),
            scheduled: false,
        };
        let body = ctx.rewriter.rewrite(&html, &context).into_owned();
        let response = Response::from_string(body)
            .with_header(make_header("Content-Type", content_type));
        request.respond(response)?;
        return Ok(());
    }

    let response = Response::from_data(fs::read(&file)?)
        .with_header(make_header("Content-Type", content_type));
    request.respond(response)?;
    Ok(())
}

/// Map a URL path to a file on disk. Upload-prefixed paths resolve under
/// the image root, everything else under the web root; directories fall
/// back to their `index.html`.
fn resolve_static(ctx: &RelayContext, path: &str) -> Option<PathBuf> {
    let upload_base = ctx.config.urls.upload_base.trim_end_matches('/');
    let resolved = match strip_url_prefix(path, upload_base) {
        Some(rest) => safe_join(ctx.store.image_root(), rest)?,
        None => safe_join(&ctx.config.serve.web_root, path)?,
    };
    if resolved.is_dir() {
        Some(resolved.join("index.html"))
    } else {
        Some(resolved)
    }
}

/// Strip a URL prefix only at a path-segment boundary, so `/uploadsx/a`
/// never counts as being under `/uploads`.
fn strip_url_prefix<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(base)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Join a URL path onto a root, refusing traversal outside it.
fn safe_join(root: &Path, path: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

// =============================================================================
// Interception helpers
// =============================================================================

/// Matcher for direct image requests under the upload base URL.
fn upload_pattern(upload_base: &str) -> Regex {
    let base = regex::escape(upload_base.trim_end_matches('/'));
    Regex::new(&format!(r"(?i)^{base}/(.+\.(?:jpe?g|png|gif))$")).expect("upload url pattern")
}

/// The logical path of an intercepted image request, if the path matches.
fn match_upload(re: &Regex, path: &str) -> Option<String> {
    re.captures(path).map(|caps| caps[1].to_string())
}

fn client_accepts_webp(request: &Request, ctx: &RelayContext) -> bool {
    let headers = RequestHeaders {
        accept: header_value(request, "accept"),
        user_agent: header_value(request, "user-agent"),
    };
    ctx.sessions.accepts(client_ip(request), &headers)
}

fn client_ip(request: &Request) -> Option<IpAddr> {
    request.remote_addr().map(|addr| addr.ip())
}

fn is_ajax(request: &Request) -> bool {
    header_value(request, "x-requested-with")
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

fn header_value<'r>(request: &'r Request, name: &str) -> Option<&'r str> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn make_header(key: &str, value: &str) -> Header {
    Header::from_bytes(key.as_bytes(), value.as_bytes()).expect("valid header")
}

// =============================================================================
// Admin boundary
// =============================================================================

/// `POST <admin-prefix>/bulk`: advance the bulk job one batch.
fn handle_bulk(request: Request, ctx: &RelayContext, query: &str) -> Result<(), ServeError> {
    if request.method() != &Method::Post {
        return respond_json(request, 405, &json!({"error": "method not allowed"}));
    }
    if let Err(e) = authorize(&request, ctx) {
        return respond_json(request, 403, &json!({"error": e.to_string()}));
    }

    let params = parse_query(query);
    let job_request = JobRequest {
        batch_size: params
            .get("batch_size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE),
        delete_originals: matches!(
            params.get("delete_originals").map(String::as_str),
            Some("1") | Some("true")
        ),
    };

    match ctx.job.advance(&job_request) {
        Ok(outcome) => {
            let body = serde_json::to_value(&outcome)?;
            respond_json(request, 200, &body)
        }
        Err(e @ JobError::NoImagesFound) => respond_json(request, 400, &json!({"error": e.to_string()})),
        Err(e) => respond_json(request, 500, &json!({"error": e.to_string()})),
    }
}

/// `POST <admin-prefix>/reset`: clear the persisted progress record.
fn handle_reset(request: Request, ctx: &RelayContext) -> Result<(), ServeError> {
    if request.method() != &Method::Post {
        return respond_json(request, 405, &json!({"error": "method not allowed"}));
    }
    if let Err(e) = authorize(&request, ctx) {
        return respond_json(request, 403, &json!({"error": e.to_string()}));
    }
    match ctx.job.reset() {
        Ok(()) => {
            let response = Response::empty(StatusCode(204));
            request.respond(response)?;
            Ok(())
        }
        Err(e) => respond_json(request, 500, &json!({"error": e.to_string()})),
    }
}

/// Bearer-token check for the admin boundary.
fn authorize(request: &Request, ctx: &RelayContext) -> Result<(), JobError> {
    let Some(expected) = ctx.config.serve.admin_token.as_deref() else {
        return Err(JobError::Unauthorized);
    };
    match header_value(request, "authorization") {
        Some(value) if value.trim() == format!("Bearer {expected}") => Ok(()),
        _ => Err(JobError::Unauthorized),
    }
}

fn respond_json(
    request: Request,
    status: u16,
    body: &serde_json::Value,
) -> Result<(), ServeError> {
    let response = Response::from_string(body.to_string())
        .with_status_code(StatusCode(status))
        .with_header(make_header("Content-Type", "application/json"));
    request.respond(response)?;
    Ok(())
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
