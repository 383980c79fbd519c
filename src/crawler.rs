//! Bounded same-domain BFS used when the home page and sitemap priority
//! pages yield no emails.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use scraper::{Html, Selector};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::core::Config;
use crate::extract::HybridExtractor;
use crate::net::{self, Fetcher};

const CRAWL_TIME_CAP_SECS: u64 = 60;

pub struct Crawler {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    hybrid: Arc<HybridExtractor>,
    /// Process-wide pages-fetched counter per domain.
    page_counts: Arc<StdMutex<HashMap<String, usize>>>,
    /// Optional per-domain page-limit overrides.
    domain_limits: StdMutex<HashMap<String, usize>>,
}

struct CrawlState {
    queue: Mutex<VecDeque<String>>,
    seen: Mutex<HashSet<String>>,
    emails: Mutex<HashSet<String>>,
}

impl Crawler {
    pub fn new(config: Arc<Config>, fetcher: Arc<Fetcher>, hybrid: Arc<HybridExtractor>) -> Self {
        Self {
            config,
            fetcher,
            hybrid,
            page_counts: Arc::new(StdMutex::new(HashMap::new())),
            domain_limits: StdMutex::new(HashMap::new()),
        }
    }

    pub fn set_domain_limit(&self, domain: &str, limit: usize) {
        self.domain_limits
            .lock()
            .expect("domain limits lock")
            .insert(domain.to_string(), limit);
    }

    pub fn domain_limit(&self, domain: &str) -> usize {
        self.domain_limits
            .lock()
            .expect("domain limits lock")
            .get(domain)
            .copied()
            .unwrap_or(self.config.max_fallback_pages)
    }

    pub fn pages_fetched(&self, domain: &str) -> usize {
        self.page_counts
            .lock()
            .expect("page counts lock")
            .get(domain)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        self.page_counts.lock().expect("page counts lock").clear();
    }

    /// Crawl `domain` breadth-first, bounded by the page limit and a
    /// wall-clock cap, returning every email found. `seed_url` is usually
    /// the final URL of the already-fetched home page.
    pub async fn crawl_small(&self, domain: &str, seed_url: Option<&str>) -> HashSet<String> {
        let limit = self.domain_limit(domain);
        let max_time = Duration::from_secs(CRAWL_TIME_CAP_SECS.min(limit as u64 * 2));
        let num_workers = self.config.crawl_workers;
        let start = Instant::now();

        info!(
            "Starting crawl of {} (limit: {} pages, timeout: {}s, workers: {})",
            domain,
            limit,
            max_time.as_secs(),
            num_workers
        );

        let start_url = seed_url
            .map(|u| u.to_string())
            .unwrap_or_else(|| format!("https://{domain}"));
        let canon_start = canonicalize_url(&start_url);

        let state = Arc::new(CrawlState {
            queue: Mutex::new(VecDeque::from([canon_start.clone()])),
            seen: Mutex::new(HashSet::from([canon_start])),
            emails: Mutex::new(HashSet::new()),
        });

        let workers: Vec<_> = (0..num_workers)
            .map(|_| {
                let state = state.clone();
                let domain = domain.to_string();
                // Each worker gets its own redirect-loop guard scope, like an
                // independent fetch session.
                net::with_fetch_guard(self.worker_loop(state, domain, limit, start, max_time))
            })
            .collect();
        join_all(workers).await;

        let emails = std::mem::take(&mut *state.emails.lock().await);
        let seen_count = state.seen.lock().await.len();
        info!(
            "Crawl of {} completed: {} pages fetched, {} unique URLs seen, {} emails, {:.1}s",
            domain,
            self.pages_fetched(domain),
            seen_count,
            emails.len(),
            start.elapsed().as_secs_f64()
        );
        emails
    }

    async fn worker_loop(
        &self,
        state: Arc<CrawlState>,
        domain: String,
        limit: usize,
        start: Instant,
        max_time: Duration,
    ) {
        loop {
            if start.elapsed() > max_time {
                return;
            }

            let url = {
                let mut queue = state.queue.lock().await;
                match queue.pop_front() {
                    Some(url) => url,
                    None => return,
                }
            };

            // Pre-fetch limit check; the increment itself happens only after
            // a successful fetch so failures never consume budget.
            if self.pages_fetched(&domain) >= limit {
                return;
            }

            debug!("Fetching {}", url);
            let Some(page) = self.fetcher.get(&url, 2).await else {
                continue;
            };

            let current = {
                let mut counts = self.page_counts.lock().expect("page counts lock");
                let entry = counts.entry(domain.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            debug!("Crawled {} ({}/{})", url, current, limit);

            let hits = self.hybrid.extract_from_response(&page).await;
            if !hits.is_empty() {
                state.emails.lock().await.extend(hits);
            }

            let links = same_domain_links(&self.config, &page.text(), page.url.as_str(), &domain);
            for canon in links {
                let mut seen = state.seen.lock().await;
                if seen.insert(canon.clone()) {
                    state.queue.lock().await.push_back(canon);
                }
            }

            if current >= limit {
                return;
            }
        }
    }
}

/// Canonical form for crawl dedup: fragment dropped, `utm_` parameters
/// filtered out, remaining query pairs sorted.
fn canonicalize_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        if !pairs.is_empty() {
            query.extend_pairs(pairs);
        }
    }
    if parsed.query().unwrap_or_default().is_empty() {
        parsed.set_query(None);
    }

    parsed.to_string()
}

/// Resolve every `<a href>` against the page URL and keep validated links
/// whose normalised host contains `domain`, in canonical form.
fn same_domain_links(config: &Config, html: &str, page_url: &str, domain: &str) -> Vec<String> {
    let hrefs: Vec<String> = {
        let doc = Html::parse_document(html);
        let sel = Selector::parse("a[href]").expect("anchor selector");
        doc.select(&sel)
            .filter_map(|a| a.value().attr("href"))
            .map(|h| h.trim().to_string())
            .filter(|h| !h.to_ascii_lowercase().starts_with("mailto:"))
            .collect()
    };

    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for href in hrefs {
        let Ok(resolved) = base.join(&href) else {
            continue;
        };
        let resolved = resolved.to_string();
        if !net::validate_url(config, &resolved) {
            continue;
        }
        let Some(netloc) = Url::parse(&resolved).ok().and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
        }) else {
            continue;
        };
        if !net::normalise_domain(&netloc).contains(domain) {
            continue;
        }
        out.push(canonicalize_url(&resolved));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserService;
    use crate::core::config::test_config;

    fn crawler() -> Crawler {
        let config = Arc::new(test_config());
        let fetcher = Arc::new(Fetcher::new(config.clone()));
        let browser = Arc::new(BrowserService::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
        ));
        let hybrid = Arc::new(HybridExtractor::new(
            config.clone(),
            fetcher.clone(),
            browser,
            false,
        ));
        Crawler::new(config, fetcher, hybrid)
    }

    #[test]
    fn domain_limit_defaults_and_overrides() {
        let c = crawler();
        assert_eq!(c.domain_limit("acme.example"), c.config.max_fallback_pages);
        c.set_domain_limit("acme.example", 3);
        assert_eq!(c.domain_limit("acme.example"), 3);
        assert_eq!(c.domain_limit("other.example"), c.config.max_fallback_pages);
    }

    #[test]
    fn counters_reset_to_zero() {
        let c = crawler();
        c.page_counts
            .lock()
            .unwrap()
            .insert("acme.example".to_string(), 7);
        assert_eq!(c.pages_fetched("acme.example"), 7);
        c.reset_counters();
        assert_eq!(c.pages_fetched("acme.example"), 0);
    }

    #[test]
    fn canonicalize_drops_fragment_and_utm() {
        assert_eq!(
            canonicalize_url("https://acme.example/a?utm_source=x&b=2&a=1#frag"),
            "https://acme.example/a?a=1&b=2"
        );
        assert_eq!(
            canonicalize_url("https://acme.example/a?utm_source=x"),
            "https://acme.example/a"
        );
        assert_eq!(
            canonicalize_url("https://acme.example/a"),
            "https://acme.example/a"
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for raw in [
            "https://acme.example/a?b=2&a=1#x",
            "https://acme.example/",
            "https://acme.example/p?utm_campaign=c",
        ] {
            let once = canonicalize_url(raw);
            assert_eq!(canonicalize_url(&once), once);
        }
    }

    #[test]
    fn links_stay_on_domain() {
        let cfg = test_config();
        let html = r#"
            <a href="/impressum">imprint</a>
            <a href="https://acme.example/contact#team">contact</a>
            <a href="https://elsewhere.example/">out</a>
            <a href="mailto:x@acme.example">mail</a>
            <a href="javascript:void(0)">js</a>
        "#;
        let links = same_domain_links(&cfg, html, "https://acme.example/", "acme.example");
        assert_eq!(
            links,
            vec![
                "https://acme.example/impressum",
                "https://acme.example/contact"
            ]
        );
    }

    #[test]
    fn subdomain_links_are_kept() {
        let cfg = test_config();
        let html = r#"<a href="https://shop.acme.example/contact">shop</a>"#;
        let links = same_domain_links(&cfg, html, "https://acme.example/", "acme.example");
        assert_eq!(links, vec!["https://shop.acme.example/contact"]);
    }
}
