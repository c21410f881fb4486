// Crawler configuration consumed at build time. The embedding scanner owns
// loading (file/CLI/env); this module only defines the shapes, the defaults,
// and build-time validation. Every default can be nudged through a
// `SCOPECRAWL_*` env var so deployments can tune without recompiling.

use serde::Deserialize;

use super::errors::CrawlerError;

/// Default user agent applied when the caller does not set one.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Top-level crawler configuration. Immutable once handed to
/// [`crate::Crawler::build`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Absolute seed URLs anchoring the batch (and, by default, the scope).
    pub seed_urls: Vec<String>,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// Maximum link depth; seeds are depth 0.
    pub max_depth: usize,
    pub max_concurrent_requests: usize,
    /// Content-length ceiling for the HEAD pre-check and GET parsing, in MB.
    pub max_content_length_mb: u64,
    /// Carried for upstream products; this core never fetches robots.txt.
    pub respect_robots_txt: bool,
    /// Recon targets routinely present broken or self-signed TLS.
    pub insecure_skip_tls_verify: bool,
    pub enable_content_length_check: bool,
    pub scope: ScopeConfig,
    pub retry: RetryConfig,
    pub auto_calibrate: AutoCalibrateConfig,
    pub normalization: NormalizationConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            seed_urls: Vec::new(),
            user_agent: std::env::var("SCOPECRAWL_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            request_timeout_secs: env_parse("SCOPECRAWL_REQUEST_TIMEOUT_SECS").unwrap_or(30),
            max_depth: env_parse("SCOPECRAWL_MAX_DEPTH").unwrap_or(5),
            max_concurrent_requests: env_parse("SCOPECRAWL_MAX_CONCURRENT").unwrap_or(10),
            max_content_length_mb: env_parse("SCOPECRAWL_MAX_CONTENT_LENGTH_MB").unwrap_or(2),
            respect_robots_txt: false,
            insecure_skip_tls_verify: true,
            enable_content_length_check: true,
            scope: ScopeConfig::default(),
            retry: RetryConfig::default(),
            auto_calibrate: AutoCalibrateConfig::default(),
            normalization: NormalizationConfig::default(),
        }
    }
}

impl CrawlerConfig {
    /// Validate invariants that would otherwise surface as runtime
    /// misbehaviour deep inside a batch.
    pub fn validate(&self) -> Result<(), CrawlerError> {
        if self.user_agent.trim().is_empty() {
            return Err(CrawlerError::Validation("user_agent is empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(CrawlerError::Validation(
                "request_timeout_secs must be positive".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(CrawlerError::Validation(
                "max_concurrent_requests must be positive".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(CrawlerError::Validation(format!(
                "retry base delay {}ms exceeds max delay {}ms",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.auto_calibrate.enabled && self.auto_calibrate.max_similar_urls == 0 {
            return Err(CrawlerError::Validation(
                "auto_calibrate.max_similar_urls must be positive when enabled".into(),
            ));
        }
        if self.retry.domain_rate_limit.max_rate_limit_errors == 0 {
            return Err(CrawlerError::Validation(
                "domain_rate_limit.max_rate_limit_errors must be positive".into(),
            ));
        }
        Ok(())
    }

    /// URL queue capacity: twice the parallelism, clamped to [50, 500].
    pub fn queue_capacity(&self) -> usize {
        (self.max_concurrent_requests * 2).clamp(50, 500)
    }

    pub fn max_content_length_bytes(&self) -> u64 {
        self.max_content_length_mb * 1024 * 1024
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// Scope policy inputs. Seed hostnames are derived from the seeds at build
/// time, not listed here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Hostnames rejected outright, together with all their subdomains.
    pub disallowed_hostnames: Vec<String>,
    /// Subdomain labels (the part left of the registrable domain) to reject,
    /// e.g. `staging` or `cdn.assets`.
    pub disallowed_subdomains: Vec<String>,
    /// Path suffixes that are never crawled (`.pdf`, `.zip`, ...).
    pub disallowed_file_extensions: Vec<String>,
    /// Automatically allow every hostname that appears in the seed list.
    pub auto_add_seed_hostnames: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            disallowed_hostnames: Vec::new(),
            disallowed_subdomains: Vec::new(),
            disallowed_file_extensions: [
                ".pdf", ".zip", ".tar", ".gz", ".exe", ".dmg", ".mp4", ".mp3", ".wav", ".avi",
                ".mov", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".woff",
                ".woff2", ".ttf", ".eot",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            auto_add_seed_hostnames: true,
        }
    }
}

/// Retry behaviour for the transport wrapper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Add up to 10% uniform jitter to each backoff sleep.
    pub enable_jitter: bool,
    /// Status codes that trigger a retry. 429 additionally feeds the
    /// per-domain throttle counter.
    pub retry_status_codes: Vec<u16>,
    pub domain_rate_limit: DomainRateLimitConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: env_parse("SCOPECRAWL_MAX_RETRIES").unwrap_or(2),
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            enable_jitter: true,
            retry_status_codes: vec![429, 502, 503, 504],
            domain_rate_limit: DomainRateLimitConfig::default(),
        }
    }
}

/// Per-host throttle accounting: after `max_rate_limit_errors` consecutive
/// 429s the host is blacklisted for `blacklist_duration_mins`; entries idle
/// past `clear_after_mins` are purged entirely by the sweep task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DomainRateLimitConfig {
    pub max_rate_limit_errors: u32,
    pub blacklist_duration_mins: u64,
    pub clear_after_mins: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DomainRateLimitConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_errors: 5,
            blacklist_duration_mins: 10,
            clear_after_mins: 60,
            sweep_interval_secs: 300,
        }
    }
}

/// Auto-calibrate (pattern collapse) policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoCalibrateConfig {
    pub enabled: bool,
    /// URLs admitted per generated pattern before the rest are collapsed.
    pub max_similar_urls: usize,
    /// Query parameter names treated as ephemeral (case-insensitive).
    pub ignore_parameters: Vec<String>,
    /// Mask path segments that look like locale/country codes.
    pub auto_detect_locales: bool,
    /// Extra locale-ish segments beyond the built-in tables.
    pub custom_locale_codes: Vec<String>,
}

impl Default for AutoCalibrateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_similar_urls: env_parse("SCOPECRAWL_MAX_SIMILAR_URLS").unwrap_or(30),
            ignore_parameters: ["page", "offset", "sort", "order", "sid", "sessionid"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            auto_detect_locales: true,
            custom_locale_codes: Vec::new(),
        }
    }
}

/// URL canonicalization used for duplicate detection, separate from the
/// minimal normalization done at resolution time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub strip_fragments: bool,
    /// Query parameters removed before duplicate comparison.
    pub tracking_parameters: Vec<String>,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            strip_fragments: true,
            tracking_parameters: [
                "utm_source",
                "utm_medium",
                "utm_campaign",
                "utm_term",
                "utm_content",
                "gclid",
                "fbclid",
                "msclkid",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Budgets for the orthogonal resource limiter. Zero disables a check.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceLimiterConfig {
    pub check_interval_secs: u64,
    pub max_system_memory_percent: f32,
    pub max_cpu_percent: f32,
    pub max_process_memory_mb: u64,
    pub max_alive_tasks: usize,
    /// Fraction of each hard cap at which a warning is logged.
    pub warning_fraction: f64,
}

impl Default for ResourceLimiterConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: env_parse("SCOPECRAWL_LIMITER_INTERVAL_SECS").unwrap_or(30),
            max_system_memory_percent: 90.0,
            max_cpu_percent: 95.0,
            max_process_memory_mb: 2048,
            max_alive_tasks: 10_000,
            warning_fraction: 0.8,
        }
    }
}
