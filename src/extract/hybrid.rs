//! Hybrid extraction: static decoding first, headless rendering only when
//! static finds nothing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::decoders;
use super::static_extractor::EmailExtractor;
use crate::browser::BrowserService;
use crate::core::Config;
use crate::net::{FetchedPage, Fetcher};

const PAGE_READ_TIMEOUT: Duration = Duration::from_secs(60);
const RENDER_MEMO_CAPACITY: u64 = 256;

pub struct HybridExtractor {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    browser: Arc<BrowserService>,
    static_extractor: EmailExtractor,
    use_js_fallback: bool,
    /// URLs already extracted this run; the global dedup for priority pages.
    seen_urls: Mutex<HashSet<String>>,
    /// Rendered-page results, memoised per URL.
    render_memo: moka::future::Cache<String, HashSet<String>>,
}

impl HybridExtractor {
    pub fn new(
        config: Arc<Config>,
        fetcher: Arc<Fetcher>,
        browser: Arc<BrowserService>,
        use_js_fallback: bool,
    ) -> Self {
        Self {
            config,
            fetcher,
            browser,
            static_extractor: EmailExtractor::new(),
            use_js_fallback,
            seen_urls: Mutex::new(HashSet::new()),
            render_memo: moka::future::Cache::builder()
                .max_capacity(RENDER_MEMO_CAPACITY)
                .build(),
        }
    }

    /// The static pass over one HTML document:
    /// 1. `data-cfemail` tags short-circuit when they decode.
    /// 2. Otherwise one text scan over the concatenation of unescaped visible
    ///    text and every decoder's candidates.
    /// 3. Otherwise the HTML scan, which adds `mailto:` links.
    pub fn static_pass(&self, html: &str) -> HashSet<String> {
        let cf_hits = self.static_extractor.extract_cfemail(html);
        if !cf_hits.is_empty() {
            debug!("cfemail hits: {}", cf_hits.len());
            return cf_hits;
        }

        let visible = {
            let doc = scraper::Html::parse_document(html);
            doc.root_element().text().collect::<Vec<_>>().join(" ")
        };
        let mut pool = decoders::unescape_entities(&visible);
        for candidate in decoders::from_char_code_candidates(html) {
            pool.push(' ');
            pool.push_str(&candidate);
        }
        for candidate in decoders::rot13_candidates(html) {
            pool.push(' ');
            pool.push_str(&candidate);
        }
        for candidate in decoders::base64_candidates(html) {
            pool.push(' ');
            pool.push_str(&candidate);
        }

        let hits = self.static_extractor.extract_from_text(&pool);
        if !hits.is_empty() {
            return hits;
        }

        self.static_extractor.extract_from_html(html)
    }

    /// Fetch `url` and extract. Returns empty when the URL was already
    /// extracted this run, is non-HTML, or is a skipped PDF.
    pub async fn extract_from_url(&self, url: &str) -> HashSet<String> {
        {
            let mut seen = self.seen_urls.lock().await;
            if !seen.insert(url.to_string()) {
                debug!("Skip duplicate {}", url);
                return HashSet::new();
            }
        }

        if !self.config.process_pdfs && url.to_ascii_lowercase().ends_with(".pdf") {
            debug!("Skipping PDF {}", url);
            return HashSet::new();
        }

        let Some(page) = self
            .fetcher
            .get_with_timeout(url, 2, PAGE_READ_TIMEOUT)
            .await
        else {
            return HashSet::new();
        };
        if !page.is_html() {
            return HashSet::new();
        }

        let hits = self.static_pass(&page.text());
        info!("Static pass found {} on {}", hits.len(), url);
        if !hits.is_empty() || !self.use_js_fallback {
            return hits;
        }

        self.render_and_extract(url).await
    }

    /// Extract from an already-fetched response without another request.
    pub async fn extract_from_response(&self, page: &FetchedPage) -> HashSet<String> {
        if !page.is_html() {
            return HashSet::new();
        }

        let hits = self.static_pass(&page.text());
        if !hits.is_empty() || !self.use_js_fallback {
            debug!("Static pass found {} on {}", hits.len(), page.url);
            return hits;
        }

        self.render_and_extract(page.url.as_str()).await
    }

    async fn render_and_extract(&self, url: &str) -> HashSet<String> {
        let key = url.to_string();
        self.render_memo
            .get_with(key, async {
                info!("JS fallback for {}", url);
                let html = self.browser.render(url).await;
                if html.is_empty() {
                    HashSet::new()
                } else {
                    self.static_pass(&html)
                }
            })
            .await
    }
}
