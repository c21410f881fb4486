//! End-to-end crawls against a local fixture server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::{Method, StatusCode};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use scopecrawl::{Crawler, CrawlerConfig, CrawlerError};

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Per-route hit counter keyed by "METHOD /path".
#[derive(Clone, Default)]
struct Hits(Arc<Mutex<HashMap<String, usize>>>);

impl Hits {
    fn record(&self, method: &Method, path: &str) {
        let mut map = self.0.lock().expect("hits lock");
        *map.entry(format!("{method} {path}")).or_insert(0) += 1;
    }

    fn count(&self, key: &str) -> usize {
        self.0
            .lock()
            .expect("hits lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn base_config(seed: &str) -> CrawlerConfig {
    let mut cfg = CrawlerConfig::default();
    cfg.seed_urls = vec![seed.to_string()];
    cfg.request_timeout_secs = 5;
    cfg.retry.max_retries = 0;
    cfg.retry.base_delay_ms = 1;
    cfg.retry.max_delay_ms = 10;
    cfg.enable_content_length_check = false;
    cfg
}

#[tokio::test]
async fn seeds_only_no_links() {
    init_logger();
    let app = Router::new().route("/", get(|| async { Html("<html></html>") }));
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let crawler = Crawler::build(base_config(&seed)).expect("build");
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("batch");

    assert_eq!(crawler.discovered_urls().await, vec![seed]);
    let stats = crawler.stats();
    assert_eq!(stats.urls_visited, 1);
    assert_eq!(stats.errors, 0);

    crawler.stop().await;
    crawler.ensure_full_shutdown().await;
}

#[tokio::test]
async fn out_of_scope_link_is_emitted_but_not_crawled() {
    init_logger();
    let app = Router::new().route(
        "/",
        get(|| async { Html(r#"<html><body><a href="https://b.test/">out</a></body></html>"#) }),
    );
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let crawler = Crawler::build(base_config(&seed)).expect("build");
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("batch");

    // The asset was extracted and counted, but never entered the
    // discovered set or the queue.
    assert_eq!(crawler.discovered_urls().await, vec![seed]);
    let stats = crawler.stats();
    assert_eq!(stats.assets_extracted, 1);
    assert_eq!(stats.urls_processed, 1);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn auto_calibrate_collapses_forum_threads() {
    init_logger();
    let hits = Hits::default();
    let read_hits = hits.clone();
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                Html(
                    r#"<html><body>
                        <a href="/read.php?tid=1&fid=1">t1</a>
                        <a href="/read.php?tid=2&fid=2">t2</a>
                        <a href="/read.php?tid=3&fid=3">t3</a>
                    </body></html>"#,
                )
            }),
        )
        .route(
            "/read.php",
            get(move |method: Method| {
                let hits = read_hits.clone();
                async move {
                    hits.record(&method, "/read.php");
                    Html("<html><body>thread</body></html>")
                }
            }),
        );
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let mut cfg = base_config(&seed);
    cfg.auto_calibrate.enabled = true;
    cfg.auto_calibrate.max_similar_urls = 1;
    cfg.auto_calibrate.ignore_parameters = vec!["tid".into(), "fid".into(), "page".into()];

    let crawler = Crawler::build(cfg).expect("build");
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("batch");

    // All three thread URLs are visible downstream...
    let discovered = crawler.discovered_urls().await;
    for tid in 1..=3 {
        assert!(
            discovered.contains(&format!("{base}/read.php?tid={tid}&fid={tid}")),
            "missing thread {tid} in {discovered:?}"
        );
    }
    // ...but only the first was actually fetched.
    assert_eq!(hits.count("GET /read.php"), 1);
}

#[tokio::test]
async fn persistent_429s_blacklist_the_host() {
    init_logger();
    let hits = Hits::default();
    let throttle_hits = hits.clone();
    let app = Router::new().route(
        "/throttled",
        get(move |method: Method| {
            let hits = throttle_hits.clone();
            async move {
                hits.record(&method, "/throttled");
                (StatusCode::TOO_MANY_REQUESTS, "slow down")
            }
        }),
    );
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let mut cfg = base_config(&seed);
    cfg.retry.max_retries = 2;
    cfg.retry.retry_status_codes = vec![429];
    cfg.retry.domain_rate_limit.max_rate_limit_errors = 3;
    cfg.retry.domain_rate_limit.blacklist_duration_mins = 10;

    let crawler = Crawler::build(cfg).expect("build");
    let transport = crawler.transport();
    let client = reqwest::Client::new();
    let cancel = CancellationToken::new();

    // Three 429s inside one retry cycle push the host over the threshold.
    let request = client.get(format!("{base}/throttled")).build().unwrap();
    let err = transport.execute(request, &cancel).await.unwrap_err();
    assert!(
        matches!(err, scopecrawl::TransportError::DomainBlacklisted { ref host } if host == "127.0.0.1"),
        "unexpected error: {err}"
    );
    assert_eq!(hits.count("GET /throttled"), 3);

    // Subsequent requests fail immediately without touching the wire.
    let request = client.get(format!("{base}/throttled")).build().unwrap();
    let err = transport.execute(request, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        scopecrawl::TransportError::DomainBlacklisted { .. }
    ));
    assert_eq!(hits.count("GET /throttled"), 3);
    assert!(transport.domains().is_blacklisted("127.0.0.1").await);
}

#[tokio::test]
async fn size_gate_records_oversized_without_fetching() {
    init_logger();
    let hits = Hits::default();
    let big_hits = hits.clone();
    // 10 MiB body; the gate's limit is 1 MB.
    let big_body: Arc<String> = Arc::new("x".repeat(10 * 1024 * 1024));
    let app = Router::new()
        .route(
            "/",
            get(|| async { Html(r#"<html><body><a href="/big">big</a></body></html>"#) }),
        )
        .route(
            "/big",
            get(move |method: Method| {
                let hits = big_hits.clone();
                let body = Arc::clone(&big_body);
                async move {
                    hits.record(&method, "/big");
                    Html(body.as_ref().clone())
                }
            }),
        );
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let mut cfg = base_config(&seed);
    cfg.enable_content_length_check = true;
    cfg.max_content_length_mb = 1;

    let crawler = Crawler::build(cfg).expect("build");
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("batch");

    let discovered = crawler.discovered_urls().await;
    assert!(discovered.contains(&format!("{base}/big")));
    assert_eq!(hits.count("HEAD /big"), 1);
    assert_eq!(hits.count("GET /big"), 0);
}

#[tokio::test]
async fn cancellation_stops_the_batch_within_grace() {
    init_logger();
    let links: String = (0..100)
        .map(|i| format!(r#"<a href="/slow?i={i}">s{i}</a>"#))
        .collect();
    let page = format!("<html><body>{links}</body></html>");
    let app = Router::new()
        .route(
            "/",
            get(move || {
                let page = page.clone();
                async move { Html(page) }
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Html("<html></html>")
            }),
        );
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let mut cfg = base_config(&seed);
    cfg.max_concurrent_requests = 5;
    cfg.auto_calibrate.enabled = false;

    let crawler = Crawler::build(cfg).expect("build");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = crawler.run_batch(cancel, &[seed]).await;
    assert!(matches!(result, Err(CrawlerError::Cancelled)));
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "took {:?}",
        started.elapsed()
    );

    // Only the seed page ever responded; cancellation itself counts no
    // errors.
    let stats = crawler.stats();
    assert_eq!(stats.urls_visited, 1);
    assert_eq!(stats.errors, 0);

    crawler.stop().await;
    crawler.ensure_full_shutdown().await;
}

#[tokio::test]
async fn disallowed_extensions_are_never_fetched() {
    init_logger();
    let hits = Hits::default();
    let zip_hits = hits.clone();
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                Html(r#"<html><body><a href="/dump.zip">zip</a><a href="/ok">ok</a></body></html>"#)
            }),
        )
        .route("/ok", get(|| async { Html("<html></html>") }))
        .route(
            "/dump.zip",
            get(move |method: Method| {
                let hits = zip_hits.clone();
                async move {
                    hits.record(&method, "/dump.zip");
                    "zipbytes"
                }
            }),
        );
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let crawler = Crawler::build(base_config(&seed)).expect("build");
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("batch");

    let discovered = crawler.discovered_urls().await;
    assert!(!discovered.contains(&format!("{base}/dump.zip")));
    assert!(discovered.contains(&format!("{base}/ok")));
    assert_eq!(hits.count("GET /dump.zip"), 0);
}

#[tokio::test]
async fn reset_then_rerun_matches_a_fresh_crawler() {
    init_logger();
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                Html(r#"<html><body><a href="/a">a</a><a href="/b">b</a></body></html>"#)
            }),
        )
        .route("/a", get(|| async { Html("<html></html>") }))
        .route("/b", get(|| async { Html("<html></html>") }));
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let crawler = Crawler::build(base_config(&seed)).expect("build");
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("first batch");
    let mut first = crawler.discovered_urls().await;
    first.sort();
    assert_eq!(first.len(), 3);

    crawler.reset_for_new_batch(&[seed.clone()]).await;
    assert!(crawler.discovered_urls().await.is_empty());
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("second batch");
    let mut second = crawler.discovered_urls().await;
    second.sort();
    assert_eq!(first, second);

    // Same pages through a fresh crawler give the same set.
    let fresh = Crawler::build(base_config(&seed)).expect("build fresh");
    fresh
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("fresh batch");
    let mut fresh_set = fresh.discovered_urls().await;
    fresh_set.sort();
    assert_eq!(first, fresh_set);
}

#[tokio::test]
async fn parent_chains_lead_back_to_the_seed() {
    init_logger();
    let app = Router::new()
        .route(
            "/",
            get(|| async { Html(r#"<html><body><a href="/level1">l1</a></body></html>"#) }),
        )
        .route(
            "/level1",
            get(|| async { Html(r#"<html><body><a href="/level2">l2</a></body></html>"#) }),
        )
        .route("/level2", get(|| async { Html("<html></html>") }));
    let base = spawn_server(app).await;
    let seed = format!("{base}/");

    let crawler = Crawler::build(base_config(&seed)).expect("build");
    crawler
        .run_batch(CancellationToken::new(), &[seed.clone()])
        .await
        .expect("batch");

    let discovered = crawler.discovered_urls().await;
    assert!(discovered.contains(&format!("{base}/level2")));
    assert_eq!(
        crawler.root_target_for(&format!("{base}/level2")).await,
        Some(seed)
    );
}
