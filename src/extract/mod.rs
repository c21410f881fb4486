// HTML asset extraction. One pass over the parsed document, fixed
// tag/attribute pairs, everything resolved against the page URL. The
// extractor is synchronous and side-effect free; the facade decides which
// emitted assets feed back into discovery.

use std::collections::HashSet;

use chrono::Utc;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use crate::core::types::{Asset, AssetType};
use crate::urls;

/// Tag/attribute pairs holding a single URL.
const TAG_ATTRS: &[(&str, &str)] = &[
    ("a", "href"),
    ("link", "href"),
    ("script", "src"),
    ("img", "src"),
    ("iframe", "src"),
    ("form", "action"),
    ("object", "data"),
    ("embed", "src"),
];

/// Tags whose `srcset` attribute holds comma-separated candidate lists.
const SRCSET_TAGS: &[&str] = &["img", "source"];

/// Parse `html` and emit an [`Asset`] for every resolvable candidate URL.
/// Candidates are deduplicated per page on their absolute form.
pub fn extract_assets(html: &str, page_url: &Url) -> Vec<Asset> {
    let document = Html::parse_document(html);
    let mut assets = Vec::new();
    let mut seen = HashSet::new();

    for (tag, attr) in TAG_ATTRS {
        let Ok(selector) = Selector::parse(&format!("{tag}[{attr}]")) else {
            continue;
        };
        for element in document.select(&selector) {
            let Some(value) = element.value().attr(attr) else {
                continue;
            };
            let rel = element.value().attr("rel");
            push_candidate(value, tag, attr, rel, page_url, &mut seen, &mut assets);
        }
    }

    for tag in SRCSET_TAGS {
        let Ok(selector) = Selector::parse(&format!("{tag}[srcset]")) else {
            continue;
        };
        for element in document.select(&selector) {
            let Some(srcset) = element.value().attr("srcset") else {
                continue;
            };
            for part in srcset.split(',') {
                // Each srcset entry is "URL [descriptor]"; only the URL
                // token matters.
                if let Some(candidate) = part.split_whitespace().next() {
                    push_candidate(candidate, tag, "srcset", None, page_url, &mut seen, &mut assets);
                }
            }
        }
    }

    assets
}

fn push_candidate(
    raw: &str,
    tag: &str,
    attr: &str,
    rel: Option<&str>,
    page_url: &Url,
    seen: &mut HashSet<String>,
    assets: &mut Vec<Asset>,
) {
    let raw = raw.trim();
    if urls::should_skip_raw(raw) || urls::is_pathological(raw) {
        return;
    }

    let resolved = match urls::resolve_url(raw, Some(page_url)) {
        Ok(u) => u,
        Err(e) => {
            warn!(candidate = raw, page = page_url.as_str(), error = %e, "failed to resolve candidate");
            return;
        }
    };
    if !urls::is_supported_scheme(&resolved) {
        return;
    }

    let absolute = resolved.to_string();
    if !seen.insert(absolute.clone()) {
        return;
    }

    assets.push(Asset {
        url: absolute,
        source_tag: tag.to_string(),
        source_attr: attr.to_string(),
        asset_type: AssetType::from_tag(tag, rel),
        discovered_at: Utc::now(),
        discovered_from: page_url.as_str().to_string(),
    });
}
