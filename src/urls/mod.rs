// URL resolution and hygiene checks. Normalization here is deliberately
// minimal (trim + whatever the `url` crate canonicalizes); the policy-driven
// pass lives in [`normalize`] and is only used for duplicate detection.

pub mod normalize;

use thiserror::Error;
use url::Url;

/// Longest raw URL accepted before resolution.
const MAX_URL_LENGTH: usize = 2000;
/// Most path-separating slashes accepted before resolution.
const MAX_PATH_SLASHES: usize = 30;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("relative URL without a base: {0:?}")]
    RelativeWithoutBase(String),
    #[error("invalid URL {raw:?}: {source}")]
    Invalid {
        raw: String,
        source: url::ParseError,
    },
}

/// Schemes (and pseudo-links) that are never crawl candidates. These are
/// skips, not errors.
pub fn should_skip_raw(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    lower.starts_with('#')
        || lower.starts_with("data:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("javascript:")
}

/// Only http(s) targets are fetched; anything else is silently dropped
/// after resolution.
pub fn is_supported_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Reject inputs that would send the crawler down degenerate paths:
/// oversized URLs, slash floods, traversal loops, and repeated-segment
/// spirals (`/a/a/a/...`). Runs on the raw string before resolution.
pub fn is_pathological(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.len() > MAX_URL_LENGTH {
        return true;
    }

    let path = path_portion(trimmed);
    if path.matches('/').count() > MAX_PATH_SLASHES {
        return true;
    }
    if path.contains("/../../../") || path.contains("/././") {
        return true;
    }

    has_repeated_segments(path)
}

/// The path part of a raw URL string: everything from the first `/` after
/// the authority, or the whole string for relative references.
fn path_portion(raw: &str) -> &str {
    let after_scheme = match raw.find("://") {
        Some(idx) => &raw[idx + 3..],
        None => return raw,
    };
    match after_scheme.find('/') {
        Some(idx) => &after_scheme[idx..],
        None => "",
    }
}

fn has_repeated_segments(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut run = 1usize;
    for window in segments.windows(2) {
        if window[0] == window[1] {
            run += 1;
            if run >= 3 {
                return true;
            }
        } else {
            run = 1;
        }
    }

    // Non-adjacent repetition (e.g. /a/b/a/b/a/b/...) shows up as one
    // segment dominating the path.
    if segments.len() > 5 {
        for seg in &segments {
            if segments.iter().filter(|s| *s == seg).count() > 5 {
                return true;
            }
        }
    }
    false
}

/// Resolve `raw` against an optional absolute base, per standard
/// relative-reference rules. A relative input with no base is an error;
/// the caller decides whether that still gets recorded downstream.
pub fn resolve_url(raw: &str, base: Option<&Url>) -> Result<Url, ResolveError> {
    let trimmed = raw.trim();
    match base {
        Some(base) => base.join(trimmed).map_err(|source| ResolveError::Invalid {
            raw: trimmed.to_string(),
            source,
        }),
        None => Url::parse(trimmed).map_err(|source| match source {
            url::ParseError::RelativeUrlWithoutBase => {
                ResolveError::RelativeWithoutBase(trimmed.to_string())
            }
            _ => ResolveError::Invalid {
                raw: trimmed.to_string(),
                source,
            },
        }),
    }
}
