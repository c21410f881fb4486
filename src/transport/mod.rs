//! Rate-limit-aware retry transport.
//!
//! A thin trait seam ([`HttpTransport`]) fronts the shared reqwest client so
//! the retry logic is testable without a network. [`RetryTransport`] wraps
//! any base transport with status-code-driven retries, capped exponential
//! backoff, and per-host blacklisting when a host keeps answering 429. The
//! blacklist decision lives here, not at call sites.

pub mod domain_state;
pub mod headers;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::{NormalizationConfig, RetryConfig};
use crate::urls::normalize::UrlNormalizer;
use domain_state::DomainRateLimiter;

/// HTTP status driving the per-host throttle counter.
const THROTTLE_STATUS: u16 = 429;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The host exhausted its throttle budget; no request was (or will be)
    /// sent until the blacklist window lapses.
    #[error("domain {host} is blacklisted after repeated throttling")]
    DomainBlacklisted { host: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request failed: {0}")]
    Upstream(#[from] anyhow::Error),
}

/// Seam over the underlying HTTP client. Production uses
/// [`ReqwestTransport`]; tests substitute deterministic fakes.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        Ok(self.client.execute(request).await?)
    }
}

/// Request-level retry wrapper with per-domain throttle state. Long-lived:
/// one instance serves every batch of a crawler.
pub struct RetryTransport {
    base: Arc<dyn HttpTransport>,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    retry_statuses: HashSet<u16>,
    domains: DomainRateLimiter,
    normalizer: UrlNormalizer,
}

impl RetryTransport {
    pub fn new(
        base: Arc<dyn HttpTransport>,
        retry: &RetryConfig,
        normalization: &NormalizationConfig,
    ) -> Self {
        let rl = &retry.domain_rate_limit;
        Self {
            base,
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter: retry.enable_jitter,
            retry_statuses: retry.retry_status_codes.iter().copied().collect(),
            domains: DomainRateLimiter::new(
                rl.max_rate_limit_errors,
                Duration::from_secs(rl.blacklist_duration_mins * 60),
                Duration::from_secs(rl.clear_after_mins * 60),
            ),
            normalizer: UrlNormalizer::new(normalization),
        }
    }

    /// Canonicalizer callers use to decide whether a raw URL duplicates one
    /// already fetched.
    pub fn normalizer(&self) -> &UrlNormalizer {
        &self.normalizer
    }

    pub fn domains(&self) -> &DomainRateLimiter {
        &self.domains
    }

    /// Execute with retries. At most `max_retries + 1` attempts; each sleep
    /// is cancellable through `cancel`.
    pub async fn execute(
        &self,
        request: reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransportError> {
        let host = request
            .url()
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .unwrap_or_default();

        if !host.is_empty() && self.domains.is_blacklisted(&host).await {
            return Err(TransportError::DomainBlacklisted { host });
        }

        let attempts = self.max_retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let outcome = match request.try_clone() {
                Some(cloned) => self.base.execute(cloned).await,
                // Non-cloneable body: single shot, no retries possible.
                None => {
                    return self
                        .base
                        .execute(request)
                        .await
                        .map_err(TransportError::Upstream)
                }
            };

            match outcome {
                Err(e) => {
                    if attempt + 1 < attempts {
                        debug!(url = request.url().as_str(), attempt, error = %e, "transport error, retrying");
                        attempt += 1;
                        continue;
                    }
                    return Err(TransportError::Upstream(e));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !self.retry_statuses.contains(&status) {
                        if !host.is_empty() {
                            self.domains.record_success(&host).await;
                        }
                        return Ok(response);
                    }

                    if status == THROTTLE_STATUS
                        && !host.is_empty()
                        && self.domains.record_throttle(&host).await
                    {
                        warn!(host, "aborting retries, host blacklisted");
                        return Err(TransportError::DomainBlacklisted { host });
                    }

                    if attempt + 1 >= attempts {
                        // Out of retries; hand the throttling response back.
                        return Ok(response);
                    }

                    drop(response);
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        url = request.url().as_str(),
                        status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retryable status, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`, plus up to 10% uniform
    /// jitter when enabled.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let mut delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter {
            let ceiling_ms = (delay.as_millis() as f64 * 0.10) as u64;
            if ceiling_ms > 0 {
                use rand::prelude::*;
                let mut rng = rand::rng();
                delay += Duration::from_millis(rng.random_range(0..=ceiling_ms));
            }
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            enable_jitter: false,
            retry_status_codes: vec![429, 503],
            ..RetryConfig::default()
        }
    }

    /// Base transport that always fails, counting attempts.
    struct FailingTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl HttpTransport for FailingTransport {
        async fn execute(&self, _request: reqwest::Request) -> Result<reqwest::Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    fn get_request(url: &str) -> reqwest::Request {
        reqwest::Client::new().get(url).build().unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let transport = RetryTransport::new(
            Arc::new(FailingTransport {
                calls: AtomicU32::new(0),
            }),
            &retry_config(3),
            &NormalizationConfig::default(),
        );
        assert_eq!(transport.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(transport.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(transport.backoff_delay(2), Duration::from_millis(400));
        // 100 * 2^5 = 3200, capped at 1000.
        assert_eq!(transport.backoff_delay(5), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut cfg = retry_config(0);
        cfg.enable_jitter = true;
        let transport = RetryTransport::new(
            Arc::new(FailingTransport {
                calls: AtomicU32::new(0),
            }),
            &cfg,
            &NormalizationConfig::default(),
        );
        for _ in 0..50 {
            let d = transport.backoff_delay(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(220));
        }
    }

    #[tokio::test]
    async fn transport_errors_retry_then_surface() {
        let base = Arc::new(FailingTransport {
            calls: AtomicU32::new(0),
        });
        let transport = RetryTransport::new(
            base.clone(),
            &retry_config(2),
            &NormalizationConfig::default(),
        );
        let cancel = CancellationToken::new();
        let err = transport
            .execute(get_request("http://t.test/x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Upstream(_)));
        assert_eq!(base.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn blacklisted_host_fails_without_touching_the_base() {
        let base = Arc::new(FailingTransport {
            calls: AtomicU32::new(0),
        });
        let mut cfg = retry_config(0);
        cfg.domain_rate_limit.max_rate_limit_errors = 1;
        let transport =
            RetryTransport::new(base.clone(), &cfg, &NormalizationConfig::default());
        transport.domains().record_throttle("t.test").await;

        let cancel = CancellationToken::new();
        let err = transport
            .execute(get_request("http://t.test/x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::DomainBlacklisted { ref host } if host == "t.test"));
        assert_eq!(base.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let base = Arc::new(FailingTransport {
            calls: AtomicU32::new(0),
        });
        let transport = RetryTransport::new(
            base.clone(),
            &retry_config(2),
            &NormalizationConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = transport
            .execute(get_request("http://t.test/x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
        assert_eq!(base.calls.load(Ordering::SeqCst), 0);
    }
}
