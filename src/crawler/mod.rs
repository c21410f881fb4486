//! Crawler facade: lifecycle, the discovery gate, and parent-link tracking.
//!
//! A [`Crawler`] is built once and then driven through one or more batches.
//! Per-batch state (discovered set, parent map, counters, pattern table,
//! engine visited set) is cleared by [`Crawler::reset_for_new_batch`];
//! long-lived state (transport + domain blacklist, HTTP client, extension
//! lookup) survives across batches.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::calibrate::AutoCalibrate;
use crate::core::config::CrawlerConfig;
use crate::core::errors::CrawlerError;
use crate::core::types::{QueuedUrl, StatsCallback, StatsReporter, StatsSnapshot};
use crate::engine::{EngineInner, FetchEngine, FetchedPage, PageProcessor, RobotsFilter};
use crate::extract;
use crate::scope::{ExtensionFilter, Scope};
use crate::transport::{ReqwestTransport, RetryTransport};
use crate::urls;

/// Independent timeout for HEAD size pre-checks so a slow host cannot
/// stall the discovery gate.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// State that lives exactly one batch.
#[derive(Debug, Default)]
struct BatchState {
    /// Normalized absolute URL → considered for visiting at least once.
    discovered: HashSet<String>,
    /// Child URL → the page it was first discovered on.
    parents: HashMap<String, String>,
    /// Discovered URL → crawl depth, for admission of derived links.
    depths: HashMap<String, usize>,
}

pub(crate) struct CrawlerCore {
    config: CrawlerConfig,
    client: reqwest::Client,
    transport: Arc<RetryTransport>,
    scope: RwLock<Arc<Scope>>,
    calibrate: AutoCalibrate,
    stats: Arc<StatsReporter>,
    batch: RwLock<BatchState>,
    seeds: RwLock<Vec<Url>>,
    batch_cancel: RwLock<CancellationToken>,
    engine: OnceLock<Weak<EngineInner>>,
}

impl CrawlerCore {
    fn engine(&self) -> Option<Arc<EngineInner>> {
        self.engine.get().and_then(Weak::upgrade)
    }

    async fn record_discovered(&self, key: &str) {
        let mut batch = self.batch.write().await;
        batch.discovered.insert(key.to_string());
    }

    /// The discovery gate. Ordering is contractual: cancellation → resolve
    /// → scope → duplicate fast path → pattern collapse → size gate →
    /// double-checked insert → enqueue.
    async fn discover_with_depth(&self, raw: &str, base: Option<&Url>, depth: Option<usize>) {
        let cancel = self.batch_cancel.read().await.clone();
        if cancel.is_cancelled() {
            return;
        }

        if urls::should_skip_raw(raw) || urls::is_pathological(raw) {
            return;
        }

        let url = match urls::resolve_url(raw, base) {
            Ok(u) => u,
            Err(e) => {
                // Deliberate: the raw form still lands in the discovered
                // set so downstream probers can take a swing at it.
                warn!(raw, error = %e, "unresolvable URL recorded, not queued");
                self.record_discovered(raw.trim()).await;
                return;
            }
        };
        if !urls::is_supported_scheme(&url) {
            return;
        }

        let scope = Arc::clone(&*self.scope.read().await);
        match scope.is_url_allowed(&url) {
            Ok(true) => {}
            Ok(false) => {
                debug!(url = url.as_str(), "out of scope");
                return;
            }
            Err(e) => {
                debug!(url = url.as_str(), error = %e, "scope check failed");
                return;
            }
        }

        // Dedup on the normalized form so fragment/tracking variants of a
        // page count as one discovery.
        let key = self.transport.normalizer().normalize(&url);
        {
            let batch = self.batch.read().await;
            if batch.discovered.contains(&key) {
                return;
            }
        }

        if self.calibrate.should_skip(&url).await {
            debug!(url = url.as_str(), "collapsed by auto-calibrate");
            self.record_discovered(&key).await;
            return;
        }

        let limit = self.config.max_content_length_bytes();
        if self.config.enable_content_length_check && limit > 0 {
            if let Some(len) = self.head_content_length(&url, &cancel).await {
                if len > limit {
                    debug!(url = url.as_str(), len, limit, "too large, recorded but not queued");
                    self.record_discovered(&key).await;
                    return;
                }
            }
        }

        let depth = match depth {
            Some(d) => d,
            None => {
                let batch = self.batch.read().await;
                base.and_then(|b| {
                    let base_key = self.transport.normalizer().normalize(b);
                    batch.depths.get(&base_key).copied()
                })
                .map(|d| d + 1)
                .unwrap_or(0)
            }
        };

        {
            let mut batch = self.batch.write().await;
            if !batch.discovered.insert(key.clone()) {
                // Lost the race to another worker.
                return;
            }
            batch.depths.insert(key, depth);
        }

        if let Some(engine) = self.engine() {
            engine.enqueue(QueuedUrl { url, depth }).await;
        }
    }

    /// HEAD the URL and parse `Content-Length`. Any failure (timeout,
    /// blacklist, missing header) means "no verdict" and the gate admits.
    async fn head_content_length(&self, url: &Url, cancel: &CancellationToken) -> Option<u64> {
        let request = self
            .client
            .head(url.clone())
            .header(reqwest::header::USER_AGENT, self.config.user_agent.as_str())
            .timeout(HEAD_TIMEOUT)
            .build()
            .ok()?;
        match self.transport.execute(request, cancel).await {
            Ok(response) => response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)?
                .to_str()
                .ok()?
                .parse()
                .ok(),
            Err(e) => {
                debug!(url = url.as_str(), error = %e, "HEAD pre-check failed");
                None
            }
        }
    }

    async fn track_parent(&self, child: &str, parent: &str) {
        let mut batch = self.batch.write().await;
        batch
            .parents
            .entry(child.to_string())
            .or_insert_with(|| parent.to_string());
    }
}

#[async_trait]
impl PageProcessor for CrawlerCore {
    async fn process_page(&self, page: FetchedPage) {
        let assets = extract::extract_assets(&page.body, &page.url);
        if assets.is_empty() {
            return;
        }
        self.stats.add_assets(assets.len() as u64);
        self.stats.add_processed();

        let scope = Arc::clone(&*self.scope.read().await);
        for asset in &assets {
            let Ok(url) = Url::parse(&asset.url) else {
                continue;
            };
            match scope.is_url_allowed(&url) {
                Ok(true) => {
                    // Parent edge is recorded before the queueing attempt.
                    self.track_parent(&asset.url, page.url.as_str()).await;
                    self.discover_with_depth(&asset.url, Some(&page.url), Some(page.depth + 1))
                        .await;
                }
                Ok(false) => {
                    debug!(asset = asset.url.as_str(), "asset out of scope, recorded only");
                }
                Err(e) => {
                    debug!(asset = asset.url.as_str(), error = %e, "asset scope check failed");
                }
            }
        }
    }
}

pub struct Crawler {
    core: Arc<CrawlerCore>,
    engine: Arc<FetchEngine>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Crawler {
    /// Construct a crawler. Validates config, wires scope, transport,
    /// pattern detector, queue, and engine. Fatal on invalid config.
    pub fn build(config: CrawlerConfig) -> Result<Self, CrawlerError> {
        config.validate()?;

        let seeds = parse_seed_list(&config.seed_urls);
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| CrawlerError::Validation(format!("failed to build HTTP client: {e}")))?;

        let transport = Arc::new(RetryTransport::new(
            Arc::new(ReqwestTransport::new(client.clone())),
            &config.retry,
            &config.normalization,
        ));

        let scope = Scope::build(&config.scope, &seeds);
        let calibrate = AutoCalibrate::new(&config.auto_calibrate);
        let stats = Arc::new(StatsReporter::new());
        let extension_filter = ExtensionFilter::new(&config.scope.disallowed_file_extensions);

        let core = Arc::new(CrawlerCore {
            config: config.clone(),
            client: client.clone(),
            transport: Arc::clone(&transport),
            scope: RwLock::new(Arc::new(scope)),
            calibrate,
            stats: Arc::clone(&stats),
            batch: RwLock::new(BatchState::default()),
            seeds: RwLock::new(seeds),
            batch_cancel: RwLock::new(CancellationToken::new()),
            engine: OnceLock::new(),
        });

        let engine = Arc::new(FetchEngine::new(
            &config,
            Arc::clone(&transport),
            client,
            extension_filter,
            Arc::clone(&stats),
            Arc::clone(&core) as Arc<dyn PageProcessor>,
        ));
        let _ = core.engine.set(Arc::downgrade(engine.inner()));

        Ok(Self {
            core,
            engine,
            sweeper: Mutex::new(None),
        })
    }

    /// Run one batch against `seeds`. Returns when the engine drains, the
    /// token is cancelled (after a short grace), or the outer batch timeout
    /// fires. Relative or unparseable seeds are logged and skipped.
    pub async fn run_batch(
        &self,
        cancel: CancellationToken,
        seeds: &[String],
    ) -> Result<(), CrawlerError> {
        let started = Instant::now();

        *self.core.batch_cancel.write().await = cancel.clone();
        self.engine.begin_batch(cancel.clone()).await;
        self.engine.ensure_batcher().await;
        self.ensure_sweeper().await;

        let parsed = parse_seed_list(seeds);
        *self.core.scope.write().await =
            Arc::new(Scope::build(&self.core.config.scope, &parsed));
        *self.core.seeds.write().await = parsed.clone();

        for seed in parsed {
            if cancel.is_cancelled() {
                return Err(CrawlerError::Cancelled);
            }
            let key = self.core.transport.normalizer().normalize(&seed);
            {
                let mut batch = self.core.batch.write().await;
                if !batch.discovered.insert(key.clone()) {
                    continue;
                }
                batch.depths.insert(key, 0);
            }
            // Seeds bypass the batcher.
            self.engine.inner().visit_now(QueuedUrl {
                url: seed,
                depth: 0,
            });
        }

        let result = self.engine.wait_for_completion(&cancel).await;
        let snapshot = self.core.stats.snapshot();
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            visited = snapshot.urls_visited,
            processed = snapshot.urls_processed,
            assets = snapshot.assets_extracted,
            errors = snapshot.errors,
            "batch finished"
        );
        result
    }

    /// Graceful shutdown: stop the batcher, drain the queue, bounded wait
    /// for workers, stop the domain-state sweeper.
    pub async fn stop(&self) {
        self.engine.stop().await;
        if let Some((token, handle)) = self.sweeper.lock().await.take() {
            token.cancel();
            let _ = handle.await;
        }
    }

    /// Block until batcher, workers, and sweeper are fully quiesced and the
    /// pattern detector has flushed its stats.
    pub async fn ensure_full_shutdown(&self) {
        self.engine.stop().await;
        self.engine.await_idle().await;
        if let Some((token, handle)) = self.sweeper.lock().await.take() {
            token.cancel();
            let _ = handle.await;
        }
        let cal = self.core.calibrate.stats().await;
        info!(
            patterns = cal.patterns_tracked,
            collapsed = cal.urls_collapsed,
            "auto-calibrate flushed"
        );
    }

    /// Clear per-batch state and install a new seed list, keeping engine,
    /// transport, and domain blacklist intact.
    pub async fn reset_for_new_batch(&self, seeds: &[String]) {
        let parsed = parse_seed_list(seeds);
        {
            let mut batch = self.core.batch.write().await;
            batch.discovered.clear();
            batch.parents.clear();
            batch.depths.clear();
        }
        self.core.stats.reset();
        self.core.calibrate.reset().await;
        self.engine.reset_visited().await;
        *self.core.scope.write().await =
            Arc::new(Scope::build(&self.core.config.scope, &parsed));
        *self.core.seeds.write().await = parsed;
    }

    /// Public entry into the discovery gate, for asset handlers and ad-hoc
    /// admission. Depth is inherited from `base` when it is a discovered
    /// page, else 0.
    pub async fn discover_url(&self, raw: &str, base: Option<&Url>) {
        self.core.discover_with_depth(raw, base, None).await;
    }

    /// Snapshot of every URL considered in-scope this batch, including ones
    /// elided by pattern collapse or the size gate.
    pub async fn discovered_urls(&self) -> Vec<String> {
        let batch = self.core.batch.read().await;
        batch.discovered.iter().cloned().collect()
    }

    /// Record a parent-link edge. First writer wins so roots stay stable.
    pub async fn track_url_parent(&self, child: &str, parent: &str) {
        self.core.track_parent(child, parent).await;
    }

    /// Walk the parent chain back to the seed that rooted `url`. Carries an
    /// explicit visited set, so a malformed chain cannot loop. Falls back
    /// to the URL's own origin when the chain dead-ends.
    pub async fn root_target_for(&self, url: &str) -> Option<String> {
        let seed_set: HashSet<String> = self
            .core
            .seeds
            .read()
            .await
            .iter()
            .map(|u| u.to_string())
            .collect();
        let batch = self.core.batch.read().await;

        let mut current = url.to_string();
        let mut walked = HashSet::new();
        loop {
            if seed_set.contains(&current) {
                return Some(current);
            }
            if !walked.insert(current.clone()) {
                debug!(url, "parent chain cycle detected");
                break;
            }
            match batch.parents.get(&current) {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }

        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| format!("{}://{h}/", u.scheme())))
    }

    pub fn enable_auto_calibrate(&self) {
        self.core.calibrate.set_enabled(true);
    }

    pub fn disable_auto_calibrate(&self) {
        self.core.calibrate.set_enabled(false);
    }

    /// Register a sink for incremental counter reports.
    pub fn set_stats_callback(&self, cb: StatsCallback) {
        self.core.stats.set_callback(Some(cb));
    }

    /// Register the robots verdict callback the engine consults when
    /// `respect_robots_txt` is on. The embedding scanner owns robots.txt
    /// fetching and parsing; this core only honours its verdicts.
    pub fn set_robots_filter(&self, filter: RobotsFilter) {
        self.engine.set_robots_filter(Some(filter));
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// The retry transport, exposed so embedders can share its normalizer
    /// and inspect domain blacklist state.
    pub fn transport(&self) -> &Arc<RetryTransport> {
        &self.core.transport
    }

    /// Cancel whatever batch is currently running. Wired to the resource
    /// limiter's shutdown callback by embedders.
    pub async fn cancel_current_batch(&self) {
        self.core.batch_cancel.read().await.cancel();
    }

    async fn ensure_sweeper(&self) {
        let mut slot = self.sweeper.lock().await;
        if let Some((_, handle)) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let token = CancellationToken::new();
        let transport = Arc::clone(&self.core.transport);
        let interval =
            Duration::from_secs(self.core.config.retry.domain_rate_limit.sweep_interval_secs);
        let sweep_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => break,
                    _ = ticker.tick() => transport.domains().sweep().await,
                }
            }
        });
        *slot = Some((token, handle));
    }
}

/// Parse caller-supplied seeds, keeping absolute http(s) URLs only.
fn parse_seed_list(raw: &[String]) -> Vec<Url> {
    let mut seeds = Vec::with_capacity(raw.len());
    for s in raw {
        match urls::resolve_url(s, None) {
            Ok(url) if urls::is_supported_scheme(&url) => seeds.push(url),
            Ok(url) => warn!(seed = s.as_str(), scheme = url.scheme(), "seed skipped, unsupported scheme"),
            Err(e) => warn!(seed = s.as_str(), error = %e, "seed skipped"),
        }
    }
    seeds
}
