//! Bounded-parallel fetch engine.
//!
//! URLs enter through a bounded queue; a single batcher task flushes them in
//! small batches (or on a 100 ms tick) into visit tasks gated by a semaphore
//! sized to the configured parallelism. The engine owns the HTTP transport,
//! the depth limit, and its internal visited set; everything page-specific
//! (extraction, discovery feedback) happens behind the [`PageProcessor`]
//! seam bound once at build time.

pub mod batcher;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::core::config::CrawlerConfig;
use crate::core::errors::CrawlerError;
use crate::core::types::{QueuedUrl, StatsReporter};
use crate::scope::ExtensionFilter;
use crate::transport::{headers, RetryTransport, TransportError};

/// Grace period granted to in-flight requests after cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(1);
/// Ceiling on waiting for workers during [`FetchEngine::stop`].
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// An HTML response body handed to the page-processing seam.
#[derive(Debug)]
pub struct FetchedPage {
    pub url: Url,
    pub depth: usize,
    pub body: String,
}

/// Bound once at build time; the crawler facade implements this with asset
/// extraction + discovery feedback.
#[async_trait]
pub trait PageProcessor: Send + Sync {
    async fn process_page(&self, page: FetchedPage);
}

/// Caller-supplied robots verdict: `true` means the URL may be fetched.
/// Consulted only when `respect_robots_txt` is on; the engine never fetches
/// or parses robots.txt itself — the embedding scanner owns that.
pub type RobotsFilter = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitOutcome {
    /// Response received (HTML or not); counters updated.
    Fetched,
    /// Silent sentinel: nothing fetched, nothing counted.
    Skipped(&'static str),
    /// Transport-fatal or unreadable response; error counter incremented
    /// by the caller.
    Errored,
}

pub struct EngineInner {
    client: reqwest::Client,
    transport: Arc<RetryTransport>,
    user_agent: String,
    request_timeout: Duration,
    max_depth: usize,
    max_content_length: u64,
    extension_filter: ExtensionFilter,
    respect_robots: bool,
    robots_filter: std::sync::RwLock<Option<RobotsFilter>>,
    semaphore: Arc<Semaphore>,
    visited: RwLock<HashSet<String>>,
    inflight: AtomicUsize,
    idle: Notify,
    stats: Arc<StatsReporter>,
    processor: Arc<dyn PageProcessor>,
    tx: mpsc::Sender<QueuedUrl>,
    batch_cancel: RwLock<CancellationToken>,
}

impl EngineInner {
    async fn current_cancel(&self) -> CancellationToken {
        self.batch_cancel.read().await.clone()
    }

    fn is_idle(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) == 0
    }

    fn robots_blocks(&self, url: &Url) -> bool {
        self.robots_filter
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|allowed| !allowed(url)))
            .unwrap_or(false)
    }

    /// Release one in-flight reservation; wakes completion waiters when the
    /// engine drains.
    pub(crate) fn release_inflight(&self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Spawn a visit task for an already-reserved URL.
    pub(crate) fn spawn_visit(self: &Arc<Self>, item: QueuedUrl) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = inner.current_cancel().await;
            match fetch_and_process(&inner, &item, &cancel).await {
                VisitOutcome::Fetched => {}
                VisitOutcome::Skipped(reason) => {
                    debug!(url = item.url.as_str(), reason, "visit skipped");
                }
                VisitOutcome::Errored => inner.stats.add_error(),
            }
            inner.release_inflight();
        });
    }

    /// Reserve and visit immediately, bypassing the batcher. Used for seeds
    /// and as the overflow path when the queue is full.
    pub(crate) fn visit_now(self: &Arc<Self>, item: QueuedUrl) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.spawn_visit(item);
    }

    /// Admit a URL to the queue. A full queue falls back to an immediate
    /// visit so discovery never blocks on dispatch.
    pub(crate) async fn enqueue(self: &Arc<Self>, item: QueuedUrl) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                debug!(url = item.url.as_str(), "queue full, visiting directly");
                self.spawn_visit(item);
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                debug!(url = item.url.as_str(), "queue closed, dropping");
                drop(item);
                self.release_inflight();
            }
        }
    }
}

async fn fetch_and_process(
    inner: &Arc<EngineInner>,
    item: &QueuedUrl,
    cancel: &CancellationToken,
) -> VisitOutcome {
    if item.depth > inner.max_depth {
        return VisitOutcome::Skipped("depth limit");
    }

    {
        let visited = inner.visited.read().await;
        if visited.contains(item.url.as_str()) {
            return VisitOutcome::Skipped("already visited");
        }
    }
    {
        let mut visited = inner.visited.write().await;
        if !visited.insert(item.url.as_str().to_string()) {
            return VisitOutcome::Skipped("already visited");
        }
    }

    let Ok(_permit) = inner.semaphore.clone().acquire_owned().await else {
        return VisitOutcome::Skipped("engine stopped");
    };

    // Request callback: cancellation, extension filter, headers.
    if cancel.is_cancelled() {
        return VisitOutcome::Skipped("cancelled");
    }
    if inner.extension_filter.is_disallowed(item.url.path()) {
        return VisitOutcome::Skipped("disallowed extension");
    }
    if inner.respect_robots && inner.robots_blocks(&item.url) {
        return VisitOutcome::Skipped("blocked by robots");
    }

    let request = match headers::apply_crawl_headers(
        inner
            .client
            .get(item.url.clone())
            .header(reqwest::header::USER_AGENT, inner.user_agent.as_str())
            .timeout(inner.request_timeout),
    )
    .build()
    {
        Ok(r) => r,
        Err(e) => {
            warn!(url = item.url.as_str(), error = %e, "failed to build request");
            return VisitOutcome::Errored;
        }
    };

    // Cancellation aborts the in-flight request, not just the next attempt.
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return VisitOutcome::Skipped("cancelled"),
        outcome = inner.transport.execute(request, cancel) => outcome,
    };
    let response = match outcome {
        Ok(r) => r,
        Err(TransportError::Cancelled) => return VisitOutcome::Skipped("cancelled"),
        Err(TransportError::DomainBlacklisted { host }) => {
            debug!(url = item.url.as_str(), host, "request dropped, domain blacklisted");
            return VisitOutcome::Errored;
        }
        Err(TransportError::Upstream(e)) => {
            warn!(url = item.url.as_str(), error = %e, "request failed");
            return VisitOutcome::Errored;
        }
    };

    // Response callback.
    inner.stats.record_visited();
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        debug!(url = item.url.as_str(), status = status.as_u16(), "error status");
        return VisitOutcome::Errored;
    }

    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/html"))
        .unwrap_or(false);
    if !is_html {
        return VisitOutcome::Fetched;
    }

    if let Some(len) = response.content_length() {
        if len > inner.max_content_length {
            debug!(url = item.url.as_str(), len, "body larger than cap, not parsed");
            return VisitOutcome::Fetched;
        }
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            warn!(url = item.url.as_str(), error = %e, "failed to read body");
            return VisitOutcome::Errored;
        }
    };
    if body.len() as u64 > inner.max_content_length {
        debug!(url = item.url.as_str(), "body larger than cap, not parsed");
        return VisitOutcome::Fetched;
    }

    inner
        .processor
        .process_page(FetchedPage {
            url: item.url.clone(),
            depth: item.depth,
            body,
        })
        .await;

    VisitOutcome::Fetched
}

struct BatcherSlot {
    rx: Option<mpsc::Receiver<QueuedUrl>>,
    handle: Option<JoinHandle<mpsc::Receiver<QueuedUrl>>>,
    token: CancellationToken,
}

pub struct FetchEngine {
    inner: Arc<EngineInner>,
    batcher: Mutex<BatcherSlot>,
}

impl FetchEngine {
    pub fn new(
        cfg: &CrawlerConfig,
        transport: Arc<RetryTransport>,
        client: reqwest::Client,
        extension_filter: ExtensionFilter,
        stats: Arc<StatsReporter>,
        processor: Arc<dyn PageProcessor>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity());
        let inner = Arc::new(EngineInner {
            client,
            transport,
            user_agent: cfg.user_agent.clone(),
            request_timeout: cfg.request_timeout(),
            max_depth: cfg.max_depth,
            max_content_length: cfg.max_content_length_bytes(),
            extension_filter,
            respect_robots: cfg.respect_robots_txt,
            robots_filter: std::sync::RwLock::new(None),
            semaphore: Arc::new(Semaphore::new(cfg.max_concurrent_requests)),
            visited: RwLock::new(HashSet::new()),
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
            stats,
            processor,
            tx,
            batch_cancel: RwLock::new(CancellationToken::new()),
        });
        Self {
            inner,
            batcher: Mutex::new(BatcherSlot {
                rx: Some(rx),
                handle: None,
                token: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    /// Install the cancellation token governing the next batch.
    pub async fn begin_batch(&self, cancel: CancellationToken) {
        *self.inner.batch_cancel.write().await = cancel;
    }

    /// Spawn the batcher task if it is not already running. Safe to call at
    /// every batch start.
    pub async fn ensure_batcher(&self) {
        let mut slot = self.batcher.lock().await;
        if let Some(handle) = slot.handle.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let rx = if let Some(handle) = slot.handle.take() {
            match handle.await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "batcher task lost, dispatch degrades to direct visits");
                    return;
                }
            }
        } else {
            match slot.rx.take() {
                Some(rx) => rx,
                None => return,
            }
        };

        let token = CancellationToken::new();
        slot.token = token.clone();
        slot.handle = Some(tokio::spawn(batcher::run_batcher(
            Arc::clone(&self.inner),
            rx,
            token,
        )));
    }

    /// Wait for the current batch to finish: all reservations released, or
    /// cancellation (with a short grace), or the outer batch timeout.
    pub async fn wait_for_completion(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CrawlerError> {
        let outer = std::cmp::max(
            self.inner.request_timeout + Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let deadline = tokio::time::sleep(outer);
        tokio::pin!(deadline);

        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            if self.inner.is_idle() {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    tokio::time::sleep(CANCEL_GRACE).await;
                    return Err(CrawlerError::Cancelled);
                }
                _ = &mut deadline => {
                    warn!(timeout_secs = outer.as_secs(), "batch wait timed out, forcing continuation");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Graceful shutdown: stop the batcher (draining its queue) and give
    /// workers a bounded window to finish.
    pub async fn stop(&self) {
        {
            let slot = self.batcher.lock().await;
            slot.token.cancel();
        }

        let waited = tokio::time::timeout(STOP_TIMEOUT, self.await_idle()).await;
        if waited.is_err() {
            warn!("engine workers still busy after stop timeout");
        }

        let mut slot = self.batcher.lock().await;
        if let Some(handle) = slot.handle.take() {
            match handle.await {
                Ok(rx) => slot.rx = Some(rx),
                Err(e) => warn!(error = %e, "batcher join failed"),
            }
        }
    }

    /// Block until every reservation is released. Unbounded; used by full
    /// shutdown after [`stop`](Self::stop).
    pub async fn await_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            if self.inner.is_idle() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// Forget every visited URL. Called between batches.
    pub async fn reset_visited(&self) {
        self.inner.visited.write().await.clear();
    }

    /// Install (or clear) the robots verdict callback. Only consulted when
    /// the config's `respect_robots_txt` flag is set.
    pub fn set_robots_filter(&self, filter: Option<RobotsFilter>) {
        if let Ok(mut slot) = self.inner.robots_filter.write() {
            *slot = filter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NormalizationConfig;
    use anyhow::Result;

    struct NoopProcessor;

    #[async_trait]
    impl PageProcessor for NoopProcessor {
        async fn process_page(&self, _page: FetchedPage) {}
    }

    struct RefusingTransport;

    #[async_trait]
    impl crate::transport::HttpTransport for RefusingTransport {
        async fn execute(&self, _request: reqwest::Request) -> Result<reqwest::Response> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    fn engine_with_refusing_transport(cfg: &CrawlerConfig) -> (FetchEngine, Arc<StatsReporter>) {
        let stats = Arc::new(StatsReporter::new());
        let transport = Arc::new(RetryTransport::new(
            Arc::new(RefusingTransport),
            &cfg.retry,
            &NormalizationConfig::default(),
        ));
        let engine = FetchEngine::new(
            cfg,
            transport,
            reqwest::Client::new(),
            ExtensionFilter::new(&cfg.scope.disallowed_file_extensions),
            Arc::clone(&stats),
            Arc::new(NoopProcessor),
        );
        (engine, stats)
    }

    fn queued(url: &str, depth: usize) -> QueuedUrl {
        QueuedUrl {
            url: Url::parse(url).unwrap(),
            depth,
        }
    }

    #[tokio::test]
    async fn failed_fetch_counts_one_error_and_goes_idle() {
        let mut cfg = CrawlerConfig::default();
        cfg.retry.max_retries = 0;
        let (engine, stats) = engine_with_refusing_transport(&cfg);

        engine.inner().visit_now(queued("http://unreachable.test/", 0));
        let cancel = CancellationToken::new();
        engine.wait_for_completion(&cancel).await.unwrap();

        assert_eq!(stats.snapshot().errors, 1);
        assert_eq!(stats.snapshot().urls_visited, 0);
    }

    #[tokio::test]
    async fn depth_and_extension_skips_are_silent() {
        let mut cfg = CrawlerConfig::default();
        cfg.max_depth = 1;
        let (engine, stats) = engine_with_refusing_transport(&cfg);

        // Over the depth limit and a disallowed extension: neither reaches
        // the transport, neither counts as an error.
        engine.inner().visit_now(queued("http://a.test/deep", 2));
        engine.inner().visit_now(queued("http://a.test/big.zip", 0));
        let cancel = CancellationToken::new();
        engine.wait_for_completion(&cancel).await.unwrap();

        assert_eq!(stats.snapshot().errors, 0);
    }

    #[tokio::test]
    async fn visited_urls_are_not_refetched() {
        let mut cfg = CrawlerConfig::default();
        cfg.retry.max_retries = 0;
        let (engine, stats) = engine_with_refusing_transport(&cfg);

        engine.inner().visit_now(queued("http://a.test/page", 0));
        engine.inner().visit_now(queued("http://a.test/page", 0));
        let cancel = CancellationToken::new();
        engine.wait_for_completion(&cancel).await.unwrap();

        // Only the first reservation produced a fetch attempt.
        assert_eq!(stats.snapshot().errors, 1);

        engine.reset_visited().await;
        engine.inner().visit_now(queued("http://a.test/page", 0));
        engine.wait_for_completion(&cancel).await.unwrap();
        assert_eq!(stats.snapshot().errors, 2);
    }

    #[tokio::test]
    async fn robots_denials_are_silent_when_the_flag_is_on() {
        let mut cfg = CrawlerConfig::default();
        cfg.retry.max_retries = 0;
        cfg.respect_robots_txt = true;
        let (engine, stats) = engine_with_refusing_transport(&cfg);
        engine.set_robots_filter(Some(Arc::new(|url: &Url| {
            !url.path().starts_with("/private")
        })));

        engine
            .inner()
            .visit_now(queued("http://a.test/private/admin", 0));
        engine.inner().visit_now(queued("http://a.test/public", 0));
        let cancel = CancellationToken::new();
        engine.wait_for_completion(&cancel).await.unwrap();

        // The denied URL never reached the transport and was not counted;
        // the permitted one produced the usual fetch failure.
        assert_eq!(stats.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn robots_filter_is_ignored_when_the_flag_is_off() {
        let mut cfg = CrawlerConfig::default();
        cfg.retry.max_retries = 0;
        let (engine, stats) = engine_with_refusing_transport(&cfg);
        engine.set_robots_filter(Some(Arc::new(|_: &Url| false)));

        engine.inner().visit_now(queued("http://a.test/anything", 0));
        let cancel = CancellationToken::new();
        engine.wait_for_completion(&cancel).await.unwrap();

        assert_eq!(stats.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn enqueue_overflow_falls_back_to_direct_visits() {
        let mut cfg = CrawlerConfig::default();
        cfg.retry.max_retries = 0;
        let (engine, stats) = engine_with_refusing_transport(&cfg);

        // No batcher running: the channel (capacity 50) fills, the rest
        // take the direct path, and every reservation still resolves once
        // the batcher starts.
        for i in 0..60 {
            engine
                .inner()
                .enqueue(queued(&format!("http://a.test/p{i}"), 0))
                .await;
        }
        engine.ensure_batcher().await;
        let cancel = CancellationToken::new();
        engine.wait_for_completion(&cancel).await.unwrap();

        assert_eq!(stats.snapshot().errors, 60);
        engine.stop().await;
    }
}
