//! End-to-end pipeline scenarios against local HTTP fixtures.
//!
//! The search endpoint is pointed at the fixture server, and fixture pages
//! are addressed as `localhost:<port>` so the whole pipeline (search →
//! scoring → home page → sitemap → crawl) runs against real HTTP.

use std::sync::Arc;

use leadscout::core::config::test_config;
use leadscout::extract::decoders;
use leadscout::{pipeline, Config, Engine, LeadRow};
use mockito::{Matcher, Server, ServerGuard};

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Fixture pages live on a plain-HTTP server; `localhost:<port>` keeps the
/// port through domain normalisation so the pipeline lands back on it.
fn local_domain(server: &ServerGuard) -> String {
    let port = server
        .host_with_port()
        .rsplit(':')
        .next()
        .expect("server port")
        .to_string();
    format!("localhost:{port}")
}

fn scenario_config(server: &ServerGuard, threshold: i32) -> Config {
    std::env::set_var("LEADSCOUT_TEST_MODE", "1");
    let mut cfg = test_config();
    cfg.search_endpoint = format!("{}/cse", server.url());
    cfg.domain_score_threshold = threshold;
    cfg.google_safe_interval = 0.1;
    cfg.min_crawl_delay = 0.02;
    cfg.max_crawl_delay = 0.08;
    cfg.sitemap_filenames = vec!["sitemap.xml".to_string()];
    cfg
}

fn search_body(links: &[&str]) -> String {
    let items: Vec<serde_json::Value> = links
        .iter()
        .map(|l| serde_json::json!({"link": l, "title": "hit", "displayLink": ""}))
        .collect();
    serde_json::json!({ "items": items }).to_string()
}

async fn mock_search(server: &mut ServerGuard, links: &[&str]) -> mockito::Mock {
    server
        .mock("GET", "/cse")
        .match_query(Matcher::Any)
        .with_header("content-type", "application/json")
        .with_body(search_body(links))
        .create_async()
        .await
}

fn engine_for(cfg: Config) -> Arc<Engine> {
    Arc::new(Engine::with_js_fallback(Arc::new(cfg), false))
}

#[tokio::test]
async fn email_on_home_page_yields_one_row() {
    init_logger();
    let mut server = Server::new_async().await;
    let domain = local_domain(&server);
    let link = format!("http://{domain}/");
    let _search = mock_search(&mut server, &[&link]).await;
    let _home = server
        .mock("GET", "/")
        .with_header("content-type", "text/html")
        .with_body("<html><body><p>Write to contact@example.com for details.</p></body></html>")
        .create_async()
        .await;

    let engine = engine_for(scenario_config(&server, 0));
    let report = pipeline::run(engine.clone(), vec!["Example Corp".to_string()]).await;
    engine.shutdown().await;

    assert_eq!(report.stats.leads, 1);
    assert_eq!(report.stats.domain, 1);
    assert_eq!(report.stats.with_email, 1);
    assert_eq!(report.stats.sitemap, 0);
    assert_eq!(
        report.rows,
        vec![LeadRow {
            company: "Example Corp".to_string(),
            domain: domain.clone(),
            email: "contact@example.com".to_string(),
        }]
    );
}

#[tokio::test]
async fn social_only_hit_is_domain_unclear() {
    init_logger();
    let mut server = Server::new_async().await;
    let _search = mock_search(&mut server, &["https://linkedin.com/company/acme"]).await;

    // Real threshold: the penalised LinkedIn score must fall short of 60.
    let engine = engine_for(scenario_config(&server, 60));
    let report = pipeline::run(engine.clone(), vec!["Acme Inc".to_string()]).await;
    engine.shutdown().await;

    assert_eq!(report.stats.leads, 1);
    assert_eq!(report.stats.domain_unclear, 1);
    assert_eq!(report.stats.domain, 0);
    assert!(report.rows.is_empty());
}

#[tokio::test]
async fn sitemap_priority_page_supplies_email() {
    init_logger();
    let mut server = Server::new_async().await;
    let domain = local_domain(&server);
    let link = format!("http://{domain}/");
    let _search = mock_search(&mut server, &[&link]).await;
    let _home = server
        .mock("GET", "/")
        .with_header("content-type", "text/html")
        .with_body("<html><body><h1>Gamma</h1><p>No contacts here.</p></body></html>")
        .create_async()
        .await;
    let sitemap_xml = format!(
        r#"<?xml version="1.0"?><urlset>
            <url><loc>http://{domain}/contact.html</loc></url>
            <url><loc>http://{domain}/blog/news-1</loc></url>
        </urlset>"#
    );
    let _head = server
        .mock("HEAD", "/sitemap.xml")
        .with_status(200)
        .create_async()
        .await;
    let _sitemap = server
        .mock("GET", "/sitemap.xml")
        .with_header("content-type", "application/xml")
        .with_body(sitemap_xml)
        .create_async()
        .await;
    let _contact = server
        .mock("GET", "/contact.html")
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="mailto:info@gamma.example">mail us</a></body></html>"#)
        .create_async()
        .await;

    let engine = engine_for(scenario_config(&server, 0));
    let report = pipeline::run(engine.clone(), vec!["Gamma GmbH".to_string()]).await;

    assert_eq!(report.stats.sitemap, 1);
    assert_eq!(report.stats.with_email, 1);
    assert_eq!(
        report.rows,
        vec![LeadRow {
            company: "Gamma GmbH".to_string(),
            domain: domain.clone(),
            email: "info@gamma.example".to_string(),
        }]
    );

    // The unfiltered view of the same sitemap lists every page; discovery
    // ran during the pipeline, so this is served from the caches.
    let (all, used) = engine.sitemaps().all_urls(&domain).await;
    assert!(used);
    assert_eq!(all.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn fallback_crawl_discovers_email_under_page_limit() {
    init_logger();
    let mut server = Server::new_async().await;
    let domain = local_domain(&server);
    let link = format!("http://{domain}/");
    let _search = mock_search(&mut server, &[&link]).await;
    let _home = server
        .mock("GET", "/")
        .with_header("content-type", "text/html")
        .with_body(
            r#"<html><body>
                 <p>Welcome to Delta.</p>
                 <a href="/impressum">Impressum</a>
                 <a href="/products">Products</a>
               </body></html>"#,
        )
        .expect_at_least(1)
        .create_async()
        .await;
    let _impressum = server
        .mock("GET", "/impressum")
        .with_header("content-type", "text/html")
        .with_body("<html><body><p>Verantwortlich: ceo@delta.ag</p></body></html>")
        .create_async()
        .await;
    let _products = server
        .mock("GET", "/products")
        .with_header("content-type", "text/html")
        .with_body("<html><body><p>Catalog.</p></body></html>")
        .create_async()
        .await;

    let engine = engine_for(scenario_config(&server, 0));
    let report = pipeline::run(engine.clone(), vec!["Delta AG".to_string()]).await;

    assert_eq!(report.stats.sitemap, 0);
    assert_eq!(report.stats.with_email, 1);
    assert_eq!(
        report.rows,
        vec![LeadRow {
            company: "Delta AG".to_string(),
            domain: domain.clone(),
            email: "ceo@delta.ag".to_string(),
        }]
    );
    let fetched = engine.crawler().pages_fetched(&domain);
    assert!(
        fetched <= engine.config().max_fallback_pages,
        "pages_fetched {fetched} exceeds limit"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn cloudflare_obfuscated_email_is_decoded_once() {
    init_logger();
    let mut server = Server::new_async().await;
    let domain = local_domain(&server);
    let link = format!("http://{domain}/");
    let _search = mock_search(&mut server, &[&link]).await;
    let encoded = decoders::encode_cfemail("hello@omega.example", 0x39);
    let _home = server
        .mock("GET", "/")
        .with_header("content-type", "text/html")
        .with_body(format!(
            r#"<html><body><a class="__cf_email__" data-cfemail="{encoded}">[email protected]</a></body></html>"#
        ))
        .create_async()
        .await;

    let engine = engine_for(scenario_config(&server, 0));
    let report = pipeline::run(engine.clone(), vec!["Omega Ltd".to_string()]).await;
    engine.shutdown().await;

    assert_eq!(report.stats.with_email, 1);
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].email, "hello@omega.example");
}

#[tokio::test]
async fn concurrent_companies_share_domain_exactly_once() {
    init_logger();
    let mut server = Server::new_async().await;
    let domain = local_domain(&server);
    let link = format!("http://{domain}/");
    let _search = mock_search(&mut server, &[&link]).await;
    let _home = server
        .mock("GET", "/")
        .with_header("content-type", "text/html")
        .with_body("<html><body><p>shared@shared.example</p></body></html>")
        .create_async()
        .await;

    let engine = engine_for(scenario_config(&server, 0));
    let report = pipeline::run(
        engine.clone(),
        vec!["Shared One".to_string(), "Shared Two".to_string()],
    )
    .await;
    engine.shutdown().await;

    assert_eq!(report.stats.leads, 2);
    assert_eq!(report.stats.domain, 1);
    assert_eq!(report.stats.skipped_domain, 1);
    assert_eq!(report.stats.with_email + report.stats.without_email, 1);
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].domain, domain);
}

#[tokio::test]
async fn search_api_failure_counts_google_error() {
    init_logger();
    let mut server = Server::new_async().await;
    let _search = server
        .mock("GET", "/cse")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let engine = engine_for(scenario_config(&server, 0));
    let report = pipeline::run(engine.clone(), vec!["Broken Corp".to_string()]).await;
    engine.shutdown().await;

    assert_eq!(report.stats.google_error, 1);
    assert_eq!(report.stats.domain, 0);
    assert!(report.rows.is_empty());
}

#[tokio::test]
async fn search_with_fallback_swallows_errors() {
    init_logger();
    let mut server = Server::new_async().await;
    let _search = server
        .mock("GET", "/cse")
        .match_query(Matcher::Any)
        .with_status(500)
        .create_async()
        .await;

    let cfg = scenario_config(&server, 0);
    let client = leadscout::search::SearchClient::new(Arc::new(cfg));
    assert!(client.search_with_fallback("anything").await.is_empty());
}

#[tokio::test]
async fn empty_search_results_count_no_google() {
    init_logger();
    let mut server = Server::new_async().await;
    let _search = mock_search(&mut server, &[]).await;

    let engine = engine_for(scenario_config(&server, 0));
    let report = pipeline::run(engine.clone(), vec!["Ghost GmbH".to_string()]).await;
    engine.shutdown().await;

    assert_eq!(report.stats.no_google, 1);
    assert!(report.rows.is_empty());
}

#[tokio::test]
async fn domain_only_row_when_configured() {
    init_logger();
    let mut server = Server::new_async().await;
    let domain = local_domain(&server);
    let link = format!("http://{domain}/");
    let _search = mock_search(&mut server, &[&link]).await;
    let _home = server
        .mock("GET", "/")
        .with_header("content-type", "text/html")
        .with_body("<html><body><p>Nothing to see.</p></body></html>")
        .expect_at_least(1)
        .create_async()
        .await;

    let mut cfg = scenario_config(&server, 0);
    cfg.save_domain_only = true;
    cfg.max_fallback_pages = 2;
    let engine = engine_for(cfg);
    let report = pipeline::run(engine.clone(), vec!["Quiet LLC".to_string()]).await;
    engine.shutdown().await;

    assert_eq!(report.stats.without_email, 1);
    assert_eq!(
        report.rows,
        vec![LeadRow {
            company: "Quiet LLC".to_string(),
            domain: domain.clone(),
            email: String::new(),
        }]
    );
}
