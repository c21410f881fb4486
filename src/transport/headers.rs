// Request header sets shared by the fetch path.

/// Cache-busting headers injected on every crawl request so intermediaries
/// hand back origin content, not a stale copy from a previous scan.
pub const CACHE_BUSTING_HEADERS: &[(&str, &str)] = &[
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// Baseline browser-shaped headers. Kept small: the goal is plausible
/// traffic, not fingerprint evasion.
pub const BASELINE_HEADERS: &[(&str, &str)] = &[
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    ),
    ("Accept-Language", "en-US,en;q=0.9"),
];

/// Apply both header sets to a request builder.
pub fn apply_crawl_headers(mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    for (name, value) in BASELINE_HEADERS.iter().chain(CACHE_BUSTING_HEADERS) {
        builder = builder.header(*name, *value);
    }
    builder
}
