//! HLS manifest URL rewriting
//!
//! The encoder writes segment references as bare file names relative to the
//! manifest. Players fetching the manifest through `/watch` or `/timelapse`
//! need absolute URLs pointing at the static segment route, so every segment
//! line is rewritten to
//!
//! ```text
//! {scheme}://{host}/{prefix}/{session_dir}/{file}
//! ```
//!
//! Directive lines, blank lines and anything that is not a bare segment
//! reference pass through byte-for-byte.

use axum::http::{header, HeaderMap, Uri};
use regex::Regex;
use std::sync::LazyLock;

/// A segment reference: a file name with a media extension, optionally below
/// relative directories
static SEGMENT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9_.\-]+/)*([A-Za-z0-9_.\-]+\.(?:ts|m4s|mp4|aac|vtt))$")
        .expect("segment line pattern is valid")
});

/// Absolute base URL for a session's segments, without a trailing slash
pub fn segment_base_url(scheme: &str, host: &str, prefix: &str, session_dir: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}://{}/{}", scheme, host, session_dir)
    } else {
        format!("{}://{}/{}/{}", scheme, host, prefix, session_dir)
    }
}

/// Rewrite every segment line of `manifest` to `{base_url}/{file}`
pub fn rewrite_manifest(manifest: &str, base_url: &str) -> String {
    let mut out = String::with_capacity(manifest.len() + base_url.len() * 8);

    for line in manifest.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let ending = &line[body.len()..];

        match SEGMENT_LINE.captures(body).and_then(|c| c.get(1)) {
            Some(file) => {
                out.push_str(base_url);
                out.push('/');
                out.push_str(file.as_str());
                out.push_str(ending);
            }
            None => out.push_str(line),
        }
    }

    out
}

/// Scheme the client used to reach us
///
/// The first `X-Forwarded-Proto` value wins; otherwise the request URI's own
/// scheme decides between `https` and `http`.
pub fn resolve_scheme(headers: &HeaderMap, uri: &Uri) -> String {
    let forwarded = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded {
        Some(proto) => proto.to_ascii_lowercase(),
        None if uri.scheme_str() == Some("https") => "https".to_string(),
        None => "http".to_string(),
    }
}

/// Host the client addressed, falling back to the configured public host
pub fn resolve_host(headers: &HeaderMap, fallback: &str) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
