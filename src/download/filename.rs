//! Destination naming for downloaded files.
//!
//! Final files live at `<output_folder>/<hash(url)>_<basename(url)>`. The
//! hash keeps two URLs with the same basename from colliding; the basename
//! keeps the file recognizable.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

/// Basename used when a URL has no usable last path segment.
pub const UNNAMED_FILE: &str = "unnamed_file";

/// Longest basename kept, in characters.
const MAX_BASENAME_CHARS: usize = 120;

/// Hex of the first 16 bytes of the SHA-256 of `url`.
#[must_use]
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest[..16].iter().fold(String::with_capacity(32), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Percent-decoded, sanitized last path segment of `url`.
///
/// Query strings and fragments are ignored. Falls back to
/// [`UNNAMED_FILE`] when nothing usable remains.
#[must_use]
pub fn basename_from_url(url: &str) -> String {
    let raw = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();

    let decoded = urlencoding::decode(&raw).map_or_else(|_| raw.clone(), |d| d.into_owned());
    let cleaned = sanitize_filename_component(&decoded);
    let truncated: String = cleaned.chars().take(MAX_BASENAME_CHARS).collect();

    if truncated.is_empty() || truncated.chars().all(|c| c == '.') {
        UNNAMED_FILE.to_string()
    } else {
        truncated
    }
}

/// Final path for `url` under `output_folder`.
#[must_use]
pub fn destination_for(output_folder: &Path, url: &str) -> PathBuf {
    output_folder.join(format!("{}_{}", url_hash(url), basename_from_url(url)))
}

pub(crate) fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\'' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    out.trim_matches('_').to_string()
}
