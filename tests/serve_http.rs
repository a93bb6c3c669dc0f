//! End-to-end HTTP tests: bind a real server on an ephemeral port and talk
//! to it over raw TCP.

use image::ImageEncoder;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use tempfile::TempDir;
use webp_relay::config::RelayConfig;
use webp_relay::serve;

/// A capable browser's Accept header.
const WEBP_ACCEPT: &str = "text/html,image/webp,*/*";

struct TestSite {
    _tmp: TempDir,
    addr: SocketAddr,
}

/// Build a site (web root + image library), bind a server on an ephemeral
/// port, and run it on a background thread.
fn start_site(admin_token: Option<&str>) -> TestSite {
    let tmp = TempDir::new().unwrap();
    let web_root = tmp.path().join("site");
    let image_root = tmp.path().join("site/uploads");
    fs::create_dir_all(&image_root).unwrap();

    write_jpeg(&image_root.join("photo.jpg"), 240, 180);
    fs::write(
        web_root.join("index.html"),
        r#"<html><body><img class="hero" src="/uploads/photo.jpg" alt="p"></body></html>"#,
    )
    .unwrap();

    let mut config = RelayConfig::default();
    config.paths.image_root = image_root;
    config.paths.cache_root = tmp.path().join("cache");
    config.serve.web_root = web_root;
    config.serve.port = 0;
    config.serve.admin_token = admin_token.map(String::from);

    let server = serve::bind(config).unwrap();
    let addr = server.addr();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    TestSite { _tmp: tmp, addr }
}

fn write_jpeg(path: &Path, width: u32, height: u32) {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            ((x * 31 + y * 17) % 256) as u8,
            ((x * 13 + y * 41) % 256) as u8,
            ((x ^ y) % 256) as u8,
        ])
    });
    let file = fs::File::create(path).unwrap();
    let writer = std::io::BufWriter::new(file);
    image::codecs::jpeg::JpegEncoder::new_with_quality(writer, 100)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
}

struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Decode an HTTP/1.1 chunked transfer-encoding body into the raw entity bytes.
fn dechunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = data[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .expect("chunk size line");
        let size_str = String::from_utf8_lossy(&data[pos..pos + line_end]);
        // A chunk-size line may carry extensions after a ';'; ignore them.
        let size_hex = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16).expect("chunk size hex");
        pos += line_end + 2;
        if size == 0 {
            break;
        }
        out.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2; // skip chunk data and trailing CRLF
    }
    out
}

/// One HTTP exchange over a fresh connection.
fn exchange(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)]) -> Reply {
    let mut stream = TcpStream::connect(addr).unwrap();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response head");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let raw_body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    // Decode chunked transfer encoding so the body is the raw entity bytes,
    // matching what a real HTTP client would expose.
    let body = match headers.get("transfer-encoding") {
        Some(te) if te.eq_ignore_ascii_case("chunked") => dechunk(&raw_body),
        _ => raw_body,
    };

    Reply {
        status,
        headers,
        body,
    }
}

// =============================================================================
// Image interception
// =============================================================================

#[test]
fn capable_client_receives_webp_with_caching_headers() {
    let site = start_site(None);
    let reply = exchange(
        site.addr,
        "GET",
        "/uploads/photo.jpg",
        &[("Accept", WEBP_ACCEPT)],
    );

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("image/webp"));
    assert_eq!(
        reply.header("cache-control"),
        Some("public, max-age=31536000")
    );
    assert_eq!(reply.header("vary"), Some("Accept"));
    let etag = reply.header("etag").expect("etag").to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    // RIFF....WEBP container magic
    assert_eq!(&reply.body[..4], b"RIFF");
    assert_eq!(&reply.body[8..12], b"WEBP");
    assert_eq!(
        reply.header("content-length").and_then(|v| v.parse::<usize>().ok()),
        Some(reply.body.len())
    );
}

#[test]
fn matching_conditional_request_yields_304_with_empty_body() {
    let site = start_site(None);
    let first = exchange(
        site.addr,
        "GET",
        "/uploads/photo.jpg",
        &[("Accept", WEBP_ACCEPT)],
    );
    let etag = first.header("etag").expect("etag").to_string();

    let not_modified = exchange(
        site.addr,
        "GET",
        "/uploads/photo.jpg",
        &[("Accept", WEBP_ACCEPT), ("If-None-Match", &etag)],
    );
    assert_eq!(not_modified.status, 304);
    assert!(not_modified.body.is_empty());

    let stale = exchange(
        site.addr,
        "GET",
        "/uploads/photo.jpg",
        &[("Accept", WEBP_ACCEPT), ("If-None-Match", "\"other\"")],
    );
    assert_eq!(stale.status, 200);
    assert_eq!(stale.header("etag"), Some(etag.as_str()));
    assert!(!stale.body.is_empty());
}

#[test]
fn incapable_client_receives_the_original() {
    let site = start_site(None);
    let ua = "Mozilla/5.0 (Windows NT 6.1; rv:30.0) Gecko/20100101 Firefox/30.0";
    let reply = exchange(
        site.addr,
        "GET",
        "/uploads/photo.jpg",
        &[("Accept", "text/html,*/*"), ("User-Agent", ua)],
    );

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("image/jpeg"));
    // JPEG SOI marker: the original bytes, untouched
    assert_eq!(&reply.body[..2], b"\xff\xd8");
}

#[test]
fn missing_image_is_a_plain_404() {
    let site = start_site(None);
    let reply = exchange(
        site.addr,
        "GET",
        "/uploads/nope.jpg",
        &[("Accept", WEBP_ACCEPT)],
    );
    assert_eq!(reply.status, 404);
}

// =============================================================================
// HTML rewriting on the static path
// =============================================================================

#[test]
fn html_is_rewritten_for_capable_clients_once_artifact_exists() {
    let site = start_site(None);

    // Artifact does not exist yet: the page passes through untouched
    let before = exchange(site.addr, "GET", "/index.html", &[("Accept", WEBP_ACCEPT)]);
    let body = String::from_utf8_lossy(&before.body).into_owned();
    assert!(!body.contains("<picture>"), "got: {body}");

    // Populate the cache via the interception path, then re-render
    exchange(
        site.addr,
        "GET",
        "/uploads/photo.jpg",
        &[("Accept", WEBP_ACCEPT)],
    );
    let after = exchange(site.addr, "GET", "/index.html", &[("Accept", WEBP_ACCEPT)]);
    let body = String::from_utf8_lossy(&after.body).into_owned();
    assert!(
        body.contains(r#"<picture><source srcset="/cache/webp/"#),
        "got: {body}"
    );
    assert!(body.contains(r#"type="image/webp""#));
    // The original tag survives verbatim as the fallback
    assert!(body.contains(r#"<img class="hero" src="/uploads/photo.jpg" alt="p">"#));
}

#[test]
fn ajax_responses_are_not_rewritten() {
    let site = start_site(None);
    // Artifact cached, client capable: only the AJAX gate blocks rewriting
    exchange(
        site.addr,
        "GET",
        "/uploads/photo.jpg",
        &[("Accept", WEBP_ACCEPT)],
    );

    let ajax = exchange(
        site.addr,
        "GET",
        "/index.html",
        &[("Accept", WEBP_ACCEPT), ("X-Requested-With", "XMLHttpRequest")],
    );
    let body = String::from_utf8_lossy(&ajax.body).into_owned();
    assert!(!body.contains("<picture>"), "got: {body}");
}

// =============================================================================
// Admin boundary
// =============================================================================

#[test]
fn bulk_endpoint_requires_the_configured_token() {
    let site = start_site(Some("secret"));

    let denied = exchange(site.addr, "POST", "/admin/bulk", &[]);
    assert_eq!(denied.status, 403);
    let body = String::from_utf8_lossy(&denied.body).into_owned();
    assert!(body.contains("unauthorized"));

    let wrong = exchange(
        site.addr,
        "POST",
        "/admin/bulk",
        &[("Authorization", "Bearer nope")],
    );
    assert_eq!(wrong.status, 403);
}

#[test]
fn bulk_endpoint_advances_the_job_and_reports_progress() {
    let site = start_site(Some("secret"));

    let reply = exchange(
        site.addr,
        "POST",
        "/admin/bulk?batch_size=10",
        &[("Authorization", "Bearer secret")],
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("application/json"));

    let payload: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(payload["progress"]["total"], 1);
    assert_eq!(payload["progress"]["processed"], 1);
    assert_eq!(payload["remaining"], 0);
    assert_eq!(payload["percentage"], 100.0);

    let reset = exchange(
        site.addr,
        "POST",
        "/admin/reset",
        &[("Authorization", "Bearer secret")],
    );
    assert_eq!(reset.status, 204);
}

#[test]
fn admin_endpoints_are_absent_without_a_token() {
    let site = start_site(None);
    let reply = exchange(site.addr, "POST", "/admin/bulk", &[]);
    assert_eq!(reply.status, 404);
}
