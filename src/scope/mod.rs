//! Scope evaluation: which URLs belong to the engagement.
//!
//! The seed list anchors the default scope. Disallow rules always win;
//! seed-derived hostnames are auto-allowed when the policy says so; an
//! empty seed set with no disallow rules means "everything goes" (single
//! ad-hoc probes). Immutable once built — the facade swaps in a fresh
//! snapshot when the seed list changes between batches.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::core::config::ScopeConfig;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("URL has no hostname: {0}")]
    MissingHostname(String),
}

#[derive(Debug)]
pub struct Scope {
    disallowed_hostnames: HashSet<String>,
    disallowed_subdomains: HashSet<String>,
    disallowed_extensions: Vec<String>,
    seed_hostnames: HashSet<String>,
    auto_add_seed_hostnames: bool,
}

impl Scope {
    /// Build a scope snapshot from policy + the current seed list. Seed
    /// hostnames are derived here; relative or unparseable seeds simply
    /// contribute nothing.
    pub fn build(cfg: &ScopeConfig, seeds: &[Url]) -> Self {
        let seed_hostnames = seeds
            .iter()
            .filter_map(|u| u.host_str())
            .map(|h| h.to_ascii_lowercase())
            .collect();

        Self {
            disallowed_hostnames: cfg
                .disallowed_hostnames
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            disallowed_subdomains: cfg
                .disallowed_subdomains
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            disallowed_extensions: cfg
                .disallowed_file_extensions
                .iter()
                .map(|e| {
                    let e = e.to_ascii_lowercase();
                    if e.starts_with('.') {
                        e
                    } else {
                        format!(".{e}")
                    }
                })
                .collect(),
            seed_hostnames,
            auto_add_seed_hostnames: cfg.auto_add_seed_hostnames,
        }
    }

    /// Decide whether `url` is in scope. Empty hostname is an error, not a
    /// rejection — the caller treats it like a parse failure.
    pub fn is_url_allowed(&self, url: &Url) -> Result<bool, ScopeError> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ScopeError::MissingHostname(url.as_str().to_string()))?
            .to_ascii_lowercase();

        if !self.is_hostname_allowed(&host) {
            debug!(url = url.as_str(), "hostname out of scope");
            return Ok(false);
        }
        if !self.is_path_allowed(url.path()) {
            debug!(url = url.as_str(), "path extension out of scope");
            return Ok(false);
        }
        Ok(true)
    }

    fn is_hostname_allowed(&self, host: &str) -> bool {
        // Disallow rules beat everything, including seed hostnames.
        for blocked in &self.disallowed_hostnames {
            if host == blocked || host.ends_with(&format!(".{blocked}")) {
                return false;
            }
        }

        if let Some(prefix) = subdomain_prefix(host) {
            if self.disallowed_subdomains.contains(prefix) {
                return false;
            }
        }

        if self.auto_add_seed_hostnames && self.seed_hostnames.contains(host) {
            return true;
        }

        if !self.seed_hostnames.is_empty() {
            return self.seed_hostnames.contains(host);
        }

        // No seed anchor configured: allow, whether or not a disallow list
        // exists (it already had its chance above).
        true
    }

    fn is_path_allowed(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        !self
            .disallowed_extensions
            .iter()
            .any(|ext| path.ends_with(ext.as_str()))
    }

    pub fn seed_hostnames(&self) -> &HashSet<String> {
        &self.seed_hostnames
    }
}

/// The part of `host` left of its registrable domain (`admin.staging` for
/// `admin.staging.example.co.uk`), or `None` when the host *is* the
/// registrable domain or has no recognizable suffix.
fn subdomain_prefix(host: &str) -> Option<&str> {
    let registrable = psl::domain_str(host)?;
    if registrable.len() >= host.len() {
        return None;
    }
    host.strip_suffix(registrable)
        .and_then(|p| p.strip_suffix('.'))
        .filter(|p| !p.is_empty())
}

/// Fast final-extension lookup used by the engine's request callback,
/// long-lived across batches.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: HashSet<String>,
}

impl ExtensionFilter {
    pub fn new(disallowed: &[String]) -> Self {
        Self {
            extensions: disallowed
                .iter()
                .map(|e| {
                    let e = e.to_ascii_lowercase();
                    if e.starts_with('.') {
                        e
                    } else {
                        format!(".{e}")
                    }
                })
                .collect(),
        }
    }

    /// Check the final extension of `path` (query/fragment must already be
    /// stripped, which `Url::path` guarantees).
    pub fn is_disallowed(&self, path: &str) -> bool {
        let file = path.rsplit('/').next().unwrap_or(path);
        match file.rfind('.') {
            Some(idx) => self
                .extensions
                .contains(&file[idx..].to_ascii_lowercase()),
            None => false,
        }
    }
}
