//! Per-company pipeline with global at-most-once domain semantics.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::browser::BrowserService;
use crate::core::{Config, LeadRow, RunStats};
use crate::crawler::Crawler;
use crate::extract::HybridExtractor;
use crate::net::{self, Fetcher};
use crate::scoring::DomainScorer;
use crate::search::SearchClient;
use crate::sitemap::SitemapParser;

const RENDER_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct DomainGuard {
    seen: HashSet<String>,
    in_progress: HashSet<String>,
}

/// Owns every pipeline component plus the cross-company shared state: the
/// seen/in-progress domain guard, per-domain page counters and token
/// buckets, and the one browser process.
pub struct Engine {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    search: SearchClient,
    scorer: DomainScorer,
    sitemaps: SitemapParser,
    hybrid: Arc<HybridExtractor>,
    crawler: Crawler,
    browser: Arc<BrowserService>,
    guard: StdMutex<DomainGuard>,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_js_fallback(config, true)
    }

    /// `use_js_fallback = false` keeps the engine fully static; no browser
    /// ever launches.
    pub fn with_js_fallback(config: Arc<Config>, use_js_fallback: bool) -> Self {
        let fetcher = Arc::new(Fetcher::new(config.clone()));
        let browser = Arc::new(BrowserService::new(RENDER_TIMEOUT, IDLE_TIMEOUT));
        let hybrid = Arc::new(HybridExtractor::new(
            config.clone(),
            fetcher.clone(),
            browser.clone(),
            use_js_fallback,
        ));
        let crawler = Crawler::new(config.clone(), fetcher.clone(), hybrid.clone());
        Self {
            search: SearchClient::new(config.clone()),
            scorer: DomainScorer::new(config.clone()),
            sitemaps: SitemapParser::new(config.clone(), fetcher.clone()),
            fetcher,
            hybrid,
            crawler,
            browser,
            guard: StdMutex::new(DomainGuard::default()),
            config,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub fn sitemaps(&self) -> &SitemapParser {
        &self.sitemaps
    }

    pub fn crawler(&self) -> &Crawler {
        &self.crawler
    }

    /// Join the browser worker; call once on the way out.
    pub async fn shutdown(&self) {
        self.browser.shutdown().await;
    }

    /// Run the full pipeline for one company: search, score, claim the
    /// domain, then harvest emails (home page → sitemap priority pages →
    /// fallback crawl). Returns the company's stats and output rows.
    pub async fn process_company(&self, company: &str) -> (RunStats, Vec<LeadRow>) {
        let start = Instant::now();
        let mut stats = RunStats { leads: 1, ..Default::default() };
        info!("Processing company: {}", company);

        let hits = match self.search.search(company, 10).await {
            Ok(hits) => hits,
            Err(e) => {
                stats.google_error = 1;
                warn!("Search error for {}: {}", company, e);
                return (stats, Vec::new());
            }
        };
        if hits.is_empty() {
            stats.no_google = 1;
            warn!("No search results for: {}", company);
            return (stats, Vec::new());
        }

        let (score, link) = self.scorer.find_best_domain(company, &hits);
        if score < self.config.domain_score_threshold {
            info!(
                "Domain score too low ({} < {}): {} for {}",
                score, self.config.domain_score_threshold, link, company
            );
            stats.domain_unclear = 1;
            return (stats, Vec::new());
        }

        let domain = net::normalise_domain(&link);

        // Claim the domain, or bail if another worker has it.
        {
            let mut guard = self.guard.lock().expect("domain guard lock");
            if guard.seen.contains(&domain) || guard.in_progress.contains(&domain) {
                info!("Skipping {}: domain already processed", domain);
                stats.skipped_domain = 1;
                return (stats, Vec::new());
            }
            guard.in_progress.insert(domain.clone());
        }

        stats.domain = 1;
        info!("Found domain: {} (score: {})", domain, score);

        let rows = self.harvest_domain(company, &domain, &mut stats).await;

        // Release the claim whatever happened above.
        {
            let mut guard = self.guard.lock().expect("domain guard lock");
            guard.in_progress.remove(&domain);
            guard.seen.insert(domain.clone());
        }

        debug!("Processed {} in {:.2}s", company, start.elapsed().as_secs_f64());
        (stats, rows)
    }

    async fn harvest_domain(
        &self,
        company: &str,
        domain: &str,
        stats: &mut RunStats,
    ) -> Vec<LeadRow> {
        let mut emails: HashSet<String> = HashSet::new();

        // Home page: fetch once, extract from the response, and keep the
        // final URL as the crawl seed.
        let main_url = format!("https://{domain}");
        let main_page = self.fetcher.get(&main_url, 2).await;
        if let Some(page) = &main_page {
            let home_hits = self.hybrid.extract_from_response(page).await;
            debug!("Found {} emails on main page", home_hits.len());
            emails.extend(home_hits);
        } else {
            warn!("Home page unavailable for {}", domain);
        }

        // Sitemap priority pages.
        let (priority_urls, used_sitemap) = self.sitemaps.priority_urls(domain).await;
        if !priority_urls.is_empty() {
            debug!("Found {} priority URLs in sitemap", priority_urls.len());
            for url in &priority_urls {
                let hits = self.hybrid.extract_from_url(url).await;
                if !hits.is_empty() {
                    debug!("Found {} emails on {}", hits.len(), url);
                }
                emails.extend(hits);
            }
        }
        if used_sitemap {
            stats.sitemap = 1;
            let (all_urls, _) = self.sitemaps.all_urls(domain).await;
            info!(
                "Used sitemap for {} ({} pages listed, {} priority)",
                domain,
                all_urls.len(),
                priority_urls.len()
            );
        }

        // Fallback crawl only when everything above came up empty.
        if emails.is_empty() {
            info!("No emails from sitemap pages, fallback crawl: {}", domain);
            let seed = main_page.as_ref().map(|p| p.url.as_str());
            let crawl_hits = self.crawler.crawl_small(domain, seed).await;
            debug!("Found {} emails from crawling", crawl_hits.len());
            emails.extend(crawl_hits);
        }

        if emails.is_empty() {
            stats.without_email = 1;
            info!("No emails found for {}", company);
            if self.config.save_domain_only {
                return vec![LeadRow {
                    company: company.to_string(),
                    domain: domain.to_string(),
                    email: String::new(),
                }];
            }
            return Vec::new();
        }

        stats.with_email = 1;
        info!("Found {} emails for {}", emails.len(), company);
        let mut sorted: Vec<String> = emails.into_iter().collect();
        sorted.sort();
        sorted
            .into_iter()
            .map(|email| LeadRow {
                company: company.to_string(),
                domain: domain.to_string(),
                email,
            })
            .collect()
    }
}
