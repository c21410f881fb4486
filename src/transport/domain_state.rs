// Per-host throttle accounting behind a readers-writer lock. The retry
// transport is the only writer; the sweep task and tests read through the
// same public surface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct DomainState {
    /// Consecutive throttle (429) responses. Reset by any non-retryable
    /// outcome for the host.
    throttle_errors: u32,
    blacklisted_at: Option<Instant>,
    last_seen: Instant,
}

/// Tracks hosts that keep answering 429 and blacklists them for a
/// configured window. Blacklist entries expire lazily on the next check;
/// a periodic sweep purges hosts idle past the longer clear interval.
#[derive(Debug)]
pub struct DomainRateLimiter {
    max_errors: u32,
    blacklist_duration: Duration,
    clear_after: Duration,
    state: RwLock<HashMap<String, DomainState>>,
}

impl DomainRateLimiter {
    pub fn new(max_errors: u32, blacklist_duration: Duration, clear_after: Duration) -> Self {
        Self {
            max_errors: max_errors.max(1),
            blacklist_duration,
            clear_after,
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Is `host` currently blacklisted? Expired entries are removed here,
    /// counter included, so a host gets a clean slate after serving its
    /// blacklist window.
    pub async fn is_blacklisted(&self, host: &str) -> bool {
        let expired = {
            let state = self.state.read().await;
            match state.get(host).and_then(|s| s.blacklisted_at) {
                Some(at) if at.elapsed() < self.blacklist_duration => return true,
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut state = self.state.write().await;
            // Re-check under the write lock; another worker may have
            // already purged or re-blacklisted the host.
            if let Some(entry) = state.get(host) {
                match entry.blacklisted_at {
                    Some(at) if at.elapsed() < self.blacklist_duration => return true,
                    Some(_) => {
                        state.remove(host);
                        debug!(host, "blacklist expired, host cleared");
                    }
                    None => {}
                }
            }
        }
        false
    }

    /// Record one throttle response. Returns `true` when this pushes the
    /// host over the threshold and onto the blacklist.
    pub async fn record_throttle(&self, host: &str) -> bool {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let entry = state.entry(host.to_string()).or_insert(DomainState {
            throttle_errors: 0,
            blacklisted_at: None,
            last_seen: now,
        });
        entry.throttle_errors += 1;
        entry.last_seen = now;
        if entry.throttle_errors >= self.max_errors && entry.blacklisted_at.is_none() {
            entry.blacklisted_at = Some(now);
            info!(
                host,
                errors = entry.throttle_errors,
                "host blacklisted after repeated throttling"
            );
            return true;
        }
        entry.blacklisted_at.is_some()
    }

    /// A non-throttled outcome breaks the consecutive-429 streak.
    pub async fn record_success(&self, host: &str) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.get_mut(host) {
            entry.throttle_errors = 0;
            entry.last_seen = Instant::now();
        }
    }

    /// Purge hosts not seen for the clear interval. Called by the owner's
    /// periodic sweep task.
    pub async fn sweep(&self) {
        let mut state = self.state.write().await;
        let before = state.len();
        state.retain(|_, entry| entry.last_seen.elapsed() < self.clear_after);
        let purged = before - state.len();
        if purged > 0 {
            debug!(purged, "domain rate-limit sweep");
        }
    }

    pub async fn tracked_hosts(&self) -> usize {
        self.state.read().await.len()
    }
}
