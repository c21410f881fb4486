//! Auto-calibrate: collapse URL families that differ only in ephemeral
//! identifiers (thread IDs, locale segments, paging parameters) so a forum
//! with fifty thousand threads costs the crawl a handful of fetches, not
//! fifty thousand.
//!
//! Every URL maps to a pattern string; once a pattern has admitted
//! `max_similar_urls` URLs, further members of the family are reported as
//! skippable. The detector is shared by concurrent workers and resettable
//! between batches.

mod locales;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::RwLock;
use url::Url;

use crate::core::config::AutoCalibrateConfig;

static COMPOUND_LOCALE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]{2})[-_]([a-z]{2})$").expect("static locale regex"));

#[derive(Debug, Default)]
struct CalibrateState {
    /// pattern → URLs admitted so far.
    patterns: HashMap<String, usize>,
    /// Raw URLs already decided once, to short-circuit repeats.
    seen_raw: HashSet<String>,
}

/// Counters reported when the detector flushes at shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrateStats {
    pub patterns_tracked: usize,
    pub urls_collapsed: u64,
}

#[derive(Debug)]
pub struct AutoCalibrate {
    enabled: AtomicBool,
    max_similar: usize,
    ignore_params: HashSet<String>,
    detect_locales: bool,
    custom_locales: HashSet<String>,
    state: RwLock<CalibrateState>,
    collapsed: AtomicU64,
}

impl AutoCalibrate {
    pub fn new(cfg: &AutoCalibrateConfig) -> Self {
        Self {
            enabled: AtomicBool::new(cfg.enabled),
            max_similar: cfg.max_similar_urls.max(1),
            ignore_params: cfg
                .ignore_parameters
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            detect_locales: cfg.auto_detect_locales,
            custom_locales: cfg
                .custom_locale_codes
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            state: RwLock::new(CalibrateState::default()),
            collapsed: AtomicU64::new(0),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Should this URL be elided from the crawl? Admits until the URL's
    /// pattern hits the cap, then collapses the rest of the family.
    pub async fn should_skip(&self, url: &Url) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let raw = url.as_str();
        let pattern = self.generate_pattern(url);

        // Read-lock fast path: repeats and already-saturated patterns.
        {
            let state = self.state.read().await;
            if state.seen_raw.contains(raw) {
                return true;
            }
            if let Some(&count) = state.patterns.get(&pattern) {
                if count >= self.max_similar {
                    self.collapsed.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
        }

        let mut state = self.state.write().await;
        if !state.seen_raw.insert(raw.to_string()) {
            // Raced with another worker on the same raw URL.
            return true;
        }
        let count = state.patterns.entry(pattern).or_insert(0);
        if *count >= self.max_similar {
            self.collapsed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        *count += 1;
        false
    }

    /// Canonical pattern for a URL. Deterministic: same URL + same policy
    /// always yields the same string.
    pub fn generate_pattern(&self, url: &Url) -> String {
        let mut pattern = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
        if let Some(port) = url.port() {
            pattern.push_str(&format!(":{port}"));
        }

        for segment in url.path().split('/').filter(|s| !s.is_empty()) {
            pattern.push('/');
            if self.detect_locales && self.is_locale_segment(segment) {
                pattern.push('*');
            } else {
                pattern.push_str(segment);
            }
        }

        let mut params: Vec<String> = url
            .query_pairs()
            .filter(|(name, _)| !self.ignore_params.contains(&name.to_ascii_lowercase()))
            .map(|(name, _)| format!("{name}=*"))
            .collect();
        if !params.is_empty() {
            params.sort();
            params.dedup();
            pattern.push('?');
            pattern.push_str(&params.join("&"));
        }

        if let Some(fragment) = url.fragment() {
            if !is_variable_fragment(fragment) {
                pattern.push('#');
                pattern.push_str(fragment);
            }
        }

        pattern
    }

    fn is_locale_segment(&self, segment: &str) -> bool {
        let lower = segment.to_ascii_lowercase();
        if self.custom_locales.contains(&lower) {
            return true;
        }
        if lower.len() == 2 {
            return locales::is_language_code(&lower) || locales::is_country_code(&lower);
        }
        if let Some(caps) = COMPOUND_LOCALE.captures(&lower) {
            let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let region = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            return locales::is_language_code(lang)
                && (locales::is_country_code(region) || locales::is_language_code(region));
        }
        false
    }

    /// Drop per-batch state. The enabled flag and policy survive.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.patterns.clear();
        state.seen_raw.clear();
        self.collapsed.store(0, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> CalibrateStats {
        let state = self.state.read().await;
        CalibrateStats {
            patterns_tracked: state.patterns.len(),
            urls_collapsed: self.collapsed.load(Ordering::Relaxed),
        }
    }
}

/// Fragments that look like ephemeral anchors (short, or one bare
/// alphanumeric token) are excluded from patterns; SPA-style routes
/// (`#/admin/users`) are structural and kept.
fn is_variable_fragment(fragment: &str) -> bool {
    fragment.len() <= 3
        || fragment
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
}
