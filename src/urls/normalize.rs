use std::collections::HashSet;

use url::Url;

use crate::core::config::NormalizationConfig;

/// Policy-driven URL canonicalization used for duplicate detection:
/// optionally drops the fragment and removes configured tracking
/// parameters. Query order is preserved so reported URLs stay recognizable.
#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    strip_fragments: bool,
    tracking: HashSet<String>,
}

impl UrlNormalizer {
    pub fn new(cfg: &NormalizationConfig) -> Self {
        Self {
            strip_fragments: cfg.strip_fragments,
            tracking: cfg
                .tracking_parameters
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Canonical string form of `url` under this policy. Idempotent:
    /// normalizing an already-normalized URL returns it unchanged.
    pub fn normalize(&self, url: &Url) -> String {
        let mut out = url.clone();

        if self.strip_fragments {
            out.set_fragment(None);
        }

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !self.tracking.contains(&name.to_ascii_lowercase()))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        if pairs.is_empty() {
            out.set_query(None);
        } else {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            out.set_query(Some(&query));
        }

        out.into()
    }

    /// Convenience wrapper for callers holding a raw string. Unparseable
    /// input comes back trimmed but otherwise untouched.
    pub fn normalize_str(&self, raw: &str) -> String {
        match Url::parse(raw.trim()) {
            Ok(url) => self.normalize(&url),
            Err(_) => raw.trim().to_string(),
        }
    }
}
