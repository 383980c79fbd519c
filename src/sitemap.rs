//! Sitemap discovery and parsing: conventional filenames first, robots.txt
//! `Sitemap:` directives second; gzip-framed documents and nested
//! `<sitemapindex>` trees handled with a cascading URL budget.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use quick_xml::events::Event;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::Config;
use crate::net::{self, Fetcher};

/// Decompression / parse guard.
pub const MAX_SITEMAP_SIZE: usize = 50 * 1024 * 1024;

const NESTED_FETCH_CONCURRENCY: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum SitemapError {
    #[error("gzip decode failed: {0}")]
    Gzip(String),
    #[error("XML parse failed: {0}")]
    Xml(String),
    #[error("content does not look like a sitemap")]
    NotXml,
}

fn looks_like_xml(content: &[u8]) -> bool {
    let trimmed = {
        let start = content
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(content.len());
        &content[start..]
    };
    let head = &trimmed[..trimmed.len().min(200)];
    let head = head.to_ascii_lowercase();
    head.starts_with(b"<?xml")
        || head.windows(7).any(|w| w == b"<urlset")
        || head.windows(13).any(|w| w == b"<sitemapindex")
}

enum Parsed {
    /// `<sitemapindex>` document: child sitemap locations.
    Index(Vec<String>),
    /// `<urlset>` (or loc-bearing) document: page locations.
    Urls(Vec<String>),
}

fn parse_document(xml: &str) -> Result<Parsed, SitemapError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.trim_text(true);

    let mut saw_index = false;
    let mut in_sitemap_entry = false;
    let mut in_loc = false;
    let mut sitemap_locs = Vec::new();
    let mut url_locs = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"sitemapindex" => saw_index = true,
                b"sitemap" => in_sitemap_entry = true,
                b"loc" => in_loc = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"sitemap" => in_sitemap_entry = false,
                b"loc" => in_loc = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_loc {
                    if let Ok(text) = e.unescape() {
                        let loc = text.trim().to_string();
                        if loc.is_empty() {
                            continue;
                        }
                        if in_sitemap_entry {
                            sitemap_locs.push(loc);
                        } else {
                            url_locs.push(loc);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SitemapError::Xml(e.to_string())),
            _ => {}
        }
    }

    if saw_index {
        Ok(Parsed::Index(sitemap_locs))
    } else {
        Ok(Parsed::Urls(url_locs))
    }
}

pub struct SitemapParser {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    processed: Mutex<HashSet<String>>,
    /// Sitemap URLs found per domain; discovery runs once per domain and
    /// later callers reuse the result.
    discovered: Mutex<HashMap<String, Vec<String>>>,
    cache: Mutex<HashMap<String, Vec<u8>>>,
}

impl SitemapParser {
    pub fn new(config: Arc<Config>, fetcher: Arc<Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            processed: Mutex::new(HashSet::new()),
            discovered: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Discovered sitemap URLs for `domain`, probing at most once per domain.
    async fn sitemaps_for(&self, domain: &str) -> Vec<String> {
        if let Some(urls) = self.discovered.lock().await.get(domain) {
            return urls.clone();
        }
        let urls = self.discover(domain).await;
        self.discovered
            .lock()
            .await
            .insert(domain.to_string(), urls.clone());
        urls
    }

    /// Discover sitemap URLs for `domain`. Conventional filenames are probed
    /// first; the first hit is cached and ends discovery. Only when none hit
    /// are robots.txt `Sitemap:` directives consulted (host-restricted to the
    /// naked domain); those may yield several.
    pub async fn discover(&self, domain: &str) -> Vec<String> {
        let naked = net::normalise_domain(domain);
        let hosts: Vec<String> = if naked.split('.').count() > 2 {
            vec![naked.clone()]
        } else {
            vec![naked.clone(), format!("www.{naked}")]
        };

        for host in &hosts {
            for fname in &self.config.sitemap_filenames {
                let url = format!("https://{host}/{fname}");
                let canon = net::canonicalise(&url);
                if !net::validate_url(&self.config, &url)
                    || self.processed.lock().await.contains(&canon)
                {
                    continue;
                }

                if self.fetcher.head(&url, 2).await.is_none() {
                    continue;
                }
                let Some(resp) = self.fetcher.get(&url, 2).await else {
                    continue;
                };
                if resp.body.is_empty() || resp.body.len() > MAX_SITEMAP_SIZE {
                    continue;
                }
                if !looks_like_xml(&resp.body) {
                    continue;
                }

                self.processed.lock().await.insert(canon.clone());
                self.cache.lock().await.insert(canon, resp.body);
                info!("Found sitemap via standard filenames: {}", url);
                return vec![url];
            }
        }

        // robots.txt fallback
        let mut found = Vec::new();
        let robots_url = format!("https://{naked}/robots.txt");
        if let Some(robots) = self.fetcher.get(&robots_url, 2).await {
            for line in robots.text().lines() {
                if !line.to_ascii_lowercase().trim_start().starts_with("sitemap:") {
                    continue;
                }
                let Some((_, raw)) = line.split_once(':') else {
                    continue;
                };
                let Some(sm_url) = net::join_url(&self.config, &naked, raw.trim()) else {
                    continue;
                };
                let canon = net::canonicalise(&sm_url);
                if self.processed.lock().await.contains(&canon)
                    || !net::validate_url(&self.config, &sm_url)
                {
                    continue;
                }
                if net::normalise_domain(&sm_url) != naked {
                    continue;
                }

                let Some(resp) = self.fetcher.get(&sm_url, 2).await else {
                    continue;
                };
                if resp.body.is_empty() || resp.body.len() > MAX_SITEMAP_SIZE {
                    continue;
                }
                if !looks_like_xml(&resp.body) {
                    continue;
                }

                self.processed.lock().await.insert(canon.clone());
                self.cache.lock().await.insert(canon, resp.body);
                info!("Found sitemap via robots.txt: {}", sm_url);
                found.push(sm_url);
            }
        }

        if found.is_empty() {
            debug!("No sitemap found for {}", domain);
        }
        found
    }

    /// Flatten a sitemap document into page URLs, following nested index
    /// entries (fetched up to 4 at a time) under the `remaining` budget that
    /// cascades through the whole recursion.
    pub fn collect_urls<'a>(
        &'a self,
        content: Vec<u8>,
        remaining: usize,
    ) -> BoxFuture<'a, Result<Vec<String>, SitemapError>> {
        Box::pin(async move {
            if content.is_empty() || content.len() > MAX_SITEMAP_SIZE {
                return Ok(Vec::new());
            }

            let content = if content.starts_with(&[0x1f, 0x8b]) {
                let mut out = Vec::new();
                let mut decoder = GzDecoder::new(&content[..]);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| SitemapError::Gzip(e.to_string()))?;
                out
            } else {
                content
            };

            if !looks_like_xml(&content) {
                return Err(SitemapError::NotXml);
            }

            let text = String::from_utf8_lossy(&content).into_owned();
            match parse_document(&text)? {
                Parsed::Urls(locs) => Ok(locs
                    .into_iter()
                    .filter(|u| net::validate_url(&self.config, u))
                    .take(remaining)
                    .collect()),
                Parsed::Index(children) => {
                    let mut seen = HashSet::new();
                    let nested: Vec<String> = children
                        .into_iter()
                        .filter(|u| net::validate_url(&self.config, u))
                        .filter(|u| seen.insert(u.clone()))
                        .collect();
                    if nested.is_empty() {
                        return Ok(Vec::new());
                    }

                    debug!("Fetching {} nested sitemaps", nested.len());
                    let pages: Vec<_> = stream::iter(nested)
                        .map(|u| {
                            let fetcher = self.fetcher.clone();
                            async move { fetcher.get(&u, 2).await }
                        })
                        .buffer_unordered(NESTED_FETCH_CONCURRENCY)
                        .collect()
                        .await;

                    let mut out: Vec<String> = Vec::new();
                    for page in pages.into_iter().flatten() {
                        if out.len() >= remaining {
                            break;
                        }
                        if !looks_like_xml(&page.body) {
                            continue;
                        }
                        match self.collect_urls(page.body, remaining - out.len()).await {
                            Ok(urls) => out.extend(urls),
                            Err(e) => warn!("Error parsing nested sitemap - {}", e),
                        }
                    }
                    out.truncate(remaining);
                    Ok(out)
                }
            }
        })
    }

    /// Page URLs whose lowercase form contains any configured priority token,
    /// capped at `max_fallback_pages`. The bool reports whether any sitemap
    /// was used at all.
    pub async fn priority_urls(&self, domain: &str) -> (Vec<String>, bool) {
        let sitemap_urls = self.sitemaps_for(domain).await;
        let used = !sitemap_urls.is_empty();

        let mut priority = Vec::new();
        let mut dedup = HashSet::new();

        'outer: for sm_url in &sitemap_urls {
            let Some(content) = self.cached_or_fetch(sm_url).await else {
                continue;
            };
            match self.collect_urls(content, self.config.max_urls_per_sitemap).await {
                Ok(urls) => {
                    for u in urls {
                        if priority.len() >= self.config.max_fallback_pages {
                            break 'outer;
                        }
                        let lower = u.to_lowercase();
                        if self.config.priority_tokens.iter().any(|t| lower.contains(t.as_str()))
                            && dedup.insert(u.clone())
                        {
                            priority.push(u);
                        }
                    }
                }
                Err(e) => warn!("Error parsing {} - {}", sm_url, e),
            }
        }

        debug!("Priority URL extraction for {}: {} URLs", domain, priority.len());
        (priority, used)
    }

    /// Every page URL in the domain's sitemaps, unfiltered. Powers domain
    /// summaries.
    pub async fn all_urls(&self, domain: &str) -> (Vec<String>, bool) {
        let sitemap_urls = self.sitemaps_for(domain).await;
        let used = !sitemap_urls.is_empty();

        let mut all = Vec::new();
        let mut dedup = HashSet::new();
        for sm_url in &sitemap_urls {
            let Some(content) = self.cached_or_fetch(sm_url).await else {
                continue;
            };
            match self.collect_urls(content, self.config.max_urls_per_sitemap).await {
                Ok(urls) => {
                    for u in urls {
                        if dedup.insert(u.clone()) {
                            all.push(u);
                        }
                    }
                }
                Err(e) => warn!("Error parsing {} - {}", sm_url, e),
            }
        }
        (all, used)
    }

    async fn cached_or_fetch(&self, sm_url: &str) -> Option<Vec<u8>> {
        let canon = net::canonicalise(sm_url);
        if let Some(content) = self.cache.lock().await.get(&canon) {
            return Some(content.clone());
        }
        let resp = self.fetcher.get(sm_url, 2).await?;
        self.cache.lock().await.insert(canon, resp.body.clone());
        Some(resp.body)
    }

    pub async fn clear_cache(&self) {
        self.processed.lock().await.clear();
        self.discovered.lock().await.clear();
        self.cache.lock().await.clear();
    }
}
