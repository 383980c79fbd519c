//! Fetch-layer behavior against a local server: scheme fallback, the
//! redirect-loop guard, HEAD semantics, and status counters.

use std::sync::Arc;

use leadscout::core::config::test_config;
use leadscout::net::{self, Fetcher};
use leadscout::Config;
use mockito::{Server, ServerGuard};

fn fast_config() -> Config {
    let mut cfg = test_config();
    cfg.min_crawl_delay = 0.01;
    cfg.max_crawl_delay = 0.04;
    cfg
}

fn localhost_url(server: &ServerGuard, scheme: &str, path: &str) -> String {
    let port = server
        .host_with_port()
        .rsplit(':')
        .next()
        .expect("server port")
        .to_string();
    format!("{scheme}://localhost:{port}{path}")
}

#[tokio::test]
async fn https_fetch_falls_back_to_plain_http() {
    let mut server = Server::new_async().await;
    let _page = server
        .mock("GET", "/page")
        .with_header("content-type", "text/html")
        .with_body("<p>ok</p>")
        .create_async()
        .await;

    let fetcher = Fetcher::new(Arc::new(fast_config()));
    let url = localhost_url(&server, "https", "/page");
    let page = net::with_fetch_guard(fetcher.get(&url, 2))
        .await
        .expect("scheme fallback should recover");
    assert_eq!(page.status, 200);
    assert_eq!(page.url.scheme(), "http");
    assert!(page.is_html());
    assert_eq!(page.text(), "<p>ok</p>");
}

#[tokio::test]
async fn loop_guard_blocks_repeat_gets_but_not_heads() {
    let mut server = Server::new_async().await;
    let _get = server
        .mock("GET", "/loop")
        .with_body("x")
        .expect_at_least(1)
        .create_async()
        .await;
    let _head = server.mock("HEAD", "/loop").create_async().await;

    let fetcher = Fetcher::new(Arc::new(fast_config()));
    let url = format!("{}/loop", server.url());

    net::with_fetch_guard(async {
        assert!(fetcher.head(&url, 1).await.is_some());
        assert!(fetcher.get(&url, 1).await.is_some());
        // Second GET of the same canonical URL is a loop: skipped.
        assert!(fetcher.get(&url, 1).await.is_none());
        // HEAD is unaffected by the guard in both directions.
        assert!(fetcher.head(&url, 1).await.is_some());
    })
    .await;

    // A fresh guard scope fetches again.
    net::with_fetch_guard(async {
        assert!(fetcher.get(&url, 1).await.is_some());
    })
    .await;
}

#[tokio::test]
async fn trailing_slash_variants_hit_the_guard() {
    let mut server = Server::new_async().await;
    let _get = server
        .mock("GET", "/dir")
        .with_body("x")
        .create_async()
        .await;
    let _get_slash = server
        .mock("GET", "/dir/")
        .with_body("x")
        .create_async()
        .await;

    let fetcher = Fetcher::new(Arc::new(fast_config()));
    let base = server.url();

    net::with_fetch_guard(async {
        assert!(fetcher.get(&format!("{base}/dir"), 1).await.is_some());
        // Same canonical page, different spelling.
        assert!(fetcher.get(&format!("{base}/dir/"), 1).await.is_none());
    })
    .await;
}

#[tokio::test]
async fn invalid_and_blocked_urls_are_skipped_without_requests() {
    let mut cfg = fast_config();
    cfg.blocked_host_suffixes = vec!["blocked.example".to_string()];
    cfg.blocked_extensions = vec![".exe".to_string()];
    let fetcher = Fetcher::new(Arc::new(cfg));

    assert!(fetcher.get("javascript:alert(1)", 1).await.is_none());
    assert!(fetcher.get("https://sub.blocked.example/", 1).await.is_none());
    assert!(fetcher.get("https://fine.example/setup.exe", 1).await.is_none());

    let stats = fetcher.stats_snapshot();
    assert_eq!(stats.get("skipped_urls").copied().unwrap_or(0), 3);
    assert!(stats.get("total_requests").is_none());
}

#[tokio::test]
async fn status_counters_record_success_and_failure() {
    let mut server = Server::new_async().await;
    let _ok = server.mock("GET", "/ok").with_body("fine").create_async().await;

    let fetcher = Fetcher::new(Arc::new(fast_config()));
    assert!(fetcher.get(&format!("{}/ok", server.url()), 1).await.is_some());
    // Unmatched path: the fixture server answers 501.
    assert!(fetcher.get(&format!("{}/missing", server.url()), 1).await.is_none());

    let stats = fetcher.stats_snapshot();
    assert_eq!(stats.get("total_requests").copied().unwrap_or(0), 2);
    assert_eq!(stats.get("status_200").copied().unwrap_or(0), 1);
    assert_eq!(stats.get("status_501").copied().unwrap_or(0), 1);
}
