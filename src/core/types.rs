use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Classification of an extracted asset, derived from its source tag.
/// `<link rel="stylesheet">` gets its own tag so reporting can tell
/// stylesheets apart from generic link relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Anchor,
    Stylesheet,
    Link,
    Script,
    Image,
    Iframe,
    Form,
    Object,
    Embed,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Anchor => "anchor",
            AssetType::Stylesheet => "stylesheet",
            AssetType::Link => "link",
            AssetType::Script => "script",
            AssetType::Image => "image",
            AssetType::Iframe => "iframe",
            AssetType::Form => "form",
            AssetType::Object => "object",
            AssetType::Embed => "embed",
        }
    }

    /// Map a source tag to its asset tag. `rel` is consulted only for
    /// `<link>` elements.
    pub fn from_tag(tag: &str, rel: Option<&str>) -> Self {
        match tag {
            "a" => AssetType::Anchor,
            "link" => {
                if rel
                    .map(|r| r.eq_ignore_ascii_case("stylesheet"))
                    .unwrap_or(false)
                {
                    AssetType::Stylesheet
                } else {
                    AssetType::Link
                }
            }
            "script" => AssetType::Script,
            "img" | "source" => AssetType::Image,
            "iframe" => AssetType::Iframe,
            "form" => AssetType::Form,
            "object" => AssetType::Object,
            "embed" => AssetType::Embed,
            _ => AssetType::Link,
        }
    }
}

/// A single URL-bearing element extracted from a fetched page.
///
/// Assets are emitted for *every* candidate that survives resolution,
/// in-scope or not; only in-scope assets feed back into discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    /// Absolute URL after resolution against the page base.
    pub url: String,
    /// Tag the URL came from (`a`, `script`, ...).
    pub source_tag: String,
    /// Attribute the URL came from (`href`, `src`, `srcset`, ...).
    pub source_attr: String,
    pub asset_type: AssetType,
    pub discovered_at: DateTime<Utc>,
    /// Page URL the asset was found on.
    pub discovered_from: String,
}

/// A URL admitted to the fetch queue, carrying its crawl depth.
#[derive(Debug, Clone)]
pub struct QueuedUrl {
    pub url: Url,
    pub depth: usize,
}

/// Monotonic counters for one batch. All increments are relaxed; the
/// counters are reporting-only and never gate control flow.
#[derive(Debug, Default)]
pub struct CrawlerStats {
    assets_extracted: AtomicU64,
    urls_processed: AtomicU64,
    errors: AtomicU64,
    urls_visited: AtomicU64,
}

impl CrawlerStats {
    pub fn record_assets(&self, n: u64) {
        self.assets_extracted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.urls_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_visited(&self) {
        self.urls_visited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            assets_extracted: self.assets_extracted.load(Ordering::Relaxed),
            urls_processed: self.urls_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            urls_visited: self.urls_visited.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter. Called between batches.
    pub fn reset(&self) {
        self.assets_extracted.store(0, Ordering::Relaxed);
        self.urls_processed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.urls_visited.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub assets_extracted: u64,
    pub urls_processed: u64,
    pub errors: u64,
    pub urls_visited: u64,
}

/// Incremental counts handed to a registered stats sink after each page.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsDelta {
    pub assets_extracted: u64,
    pub urls_processed: u64,
    pub errors: u64,
}

impl StatsDelta {
    pub fn is_empty(&self) -> bool {
        self.assets_extracted == 0 && self.urls_processed == 0 && self.errors == 0
    }
}

/// Sink for incremental stats reporting.
pub type StatsCallback = Arc<dyn Fn(StatsDelta) + Send + Sync>;

/// Counters plus the optional incremental sink, shared between the engine
/// and the facade. Every increment fires the sink with just that delta, so
/// downstream consumers see the same monotonic totals the snapshot does.
#[derive(Default)]
pub struct StatsReporter {
    stats: CrawlerStats,
    callback: std::sync::RwLock<Option<StatsCallback>>,
}

impl StatsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, cb: Option<StatsCallback>) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = cb;
        }
    }

    pub fn add_assets(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.stats.record_assets(n);
        self.emit(StatsDelta {
            assets_extracted: n,
            ..StatsDelta::default()
        });
    }

    pub fn add_processed(&self) {
        self.stats.record_processed();
        self.emit(StatsDelta {
            urls_processed: 1,
            ..StatsDelta::default()
        });
    }

    pub fn add_error(&self) {
        self.stats.record_error();
        self.emit(StatsDelta {
            errors: 1,
            ..StatsDelta::default()
        });
    }

    /// Internal visited counter; not part of the reported trio.
    pub fn record_visited(&self) {
        self.stats.record_visited();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset(&self) {
        self.stats.reset();
    }

    fn emit(&self, delta: StatsDelta) {
        if let Ok(slot) = self.callback.read() {
            if let Some(cb) = slot.as_ref() {
                cb(delta);
            }
        }
    }
}

impl std::fmt::Debug for StatsReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsReporter")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
