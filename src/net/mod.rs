//! HTTP fetch layer: URL validation and canonicalisation, per-domain clients
//! with independent cookie jars, token-bucket pacing, redirect-loop guard,
//! and the retry/fallback ladder (429 backoff, TLS-off, `www.` prefix,
//! https→http downgrade).

pub mod rate_limit;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, Proxy};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::antibot;
use crate::core::Config;
use rate_limit::DomainBuckets;

const RETRY_DELAY: f64 = 1.0;
const LOOP_GUARD_KEEP: usize = 1000;

tokio::task_local! {
    /// Canonical URLs already fetched by GET within the current worker task.
    /// The redirect-loop guard; HEADs neither read nor write it.
    static FETCH_GUARD: RefCell<HashSet<String>>;
}

/// Run `fut` with its own redirect-loop guard. Each company task and each
/// crawler worker gets a fresh scope, mirroring per-worker session state.
pub async fn with_fetch_guard<F>(fut: F) -> F::Output
where
    F: std::future::Future,
{
    FETCH_GUARD.scope(RefCell::new(HashSet::new()), fut).await
}

fn guard_contains(canon: &str) -> bool {
    FETCH_GUARD
        .try_with(|g| g.borrow().contains(canon))
        .unwrap_or(false)
}

fn guard_insert(canon: String) {
    let _ = FETCH_GUARD.try_with(|g| {
        let mut g = g.borrow_mut();
        g.insert(canon);
        if g.len() > LOOP_GUARD_KEEP {
            g.clear();
        }
    });
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Canonical form: lowercase scheme and host, `www.` stripped, trailing slash
/// stripped from the path (default `/`), query and fragment dropped.
/// Equality of canonical forms defines "same page".
pub fn canonicalise(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.trim().to_ascii_lowercase();
    };
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let path = parsed.path().trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    match parsed.port() {
        Some(port) => format!("{}://{}:{}{}", parsed.scheme(), host, port, path),
        None => format!("{}://{}{}", parsed.scheme(), host, path),
    }
}

/// Lowercased netloc (host, plus port when explicit) with any leading
/// `www.` removed. Accepts a full URL or a bare host.
pub fn normalise_domain(url_or_host: &str) -> String {
    let netloc = if url_or_host.starts_with("http://") || url_or_host.starts_with("https://") {
        Url::parse(url_or_host)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| url_or_host.to_string())
    } else {
        url_or_host.to_string()
    };
    let netloc = netloc.to_ascii_lowercase();
    netloc.strip_prefix("www.").unwrap_or(&netloc).to_string()
}

/// Syntactic validation: length, scheme, host presence, dangerous schemes.
pub fn validate_url(config: &Config, url: &str) -> bool {
    if url.is_empty() || url.len() > config.max_url_length {
        return false;
    }
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("file:") || lower.starts_with("data:") || lower.starts_with("javascript:")
    {
        return false;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    parsed.host_str().map(|h| !h.is_empty()).unwrap_or(false)
}

/// True when the host ends with a blocked suffix or the path ends with a
/// blocked extension.
pub fn is_blocked(config: &Config, url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let path = parsed.path().to_ascii_lowercase();
    config
        .blocked_host_suffixes
        .iter()
        .any(|pat| host.ends_with(pat.as_str()))
        || config
            .blocked_extensions
            .iter()
            .any(|pat| path.ends_with(pat.as_str()))
}

/// Join a base (URL or bare domain) with a path, validating the result.
pub fn join_url(config: &Config, base: &str, path: &str) -> Option<String> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Some(path.to_string());
    }
    let base = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("https://{base}")
    };
    let joined = Url::parse(&base)
        .ok()?
        .join(path.trim_start_matches('/'))
        .ok()?
        .to_string();
    if !validate_url(config, &joined) {
        warn!("Invalid joined URL: {} + {}", base, path);
        return None;
    }
    Some(joined)
}

// ---------------------------------------------------------------------------
// Fetched page
// ---------------------------------------------------------------------------

/// A successful (2xx) response: final URL after redirects, status, headers of
/// interest and the body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_html(&self) -> bool {
        self.content_type.contains("html")
    }
}

struct FetchFailure {
    status: Option<u16>,
    tls: bool,
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Issues validated GET/HEAD requests with per-domain pacing, retry and
/// fallback. Returns `None` for anything unrecoverable; callers treat that
/// as "page unavailable" and move on.
pub struct Fetcher {
    config: Arc<Config>,
    buckets: DomainBuckets,
    clients: Mutex<HashMap<String, Client>>,
    proxy_clients: OnceLock<Vec<Client>>,
    insecure_client: OnceLock<Option<Client>>,
    stats: StdMutex<HashMap<String, u64>>,
}

impl Fetcher {
    pub fn new(config: Arc<Config>) -> Self {
        let buckets = DomainBuckets::new(config.min_crawl_delay, config.max_crawl_delay);
        Self {
            config,
            buckets,
            clients: Mutex::new(HashMap::new()),
            proxy_clients: OnceLock::new(),
            insecure_client: OnceLock::new(),
            stats: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, url: &str, retry_count: u32) -> Option<FetchedPage> {
        self.request(url, Method::GET, retry_count, None).await
    }

    pub async fn get_with_timeout(
        &self,
        url: &str,
        retry_count: u32,
        read_timeout: Duration,
    ) -> Option<FetchedPage> {
        self.request(url, Method::GET, retry_count, Some(read_timeout))
            .await
    }

    pub async fn head(&self, url: &str, retry_count: u32) -> Option<FetchedPage> {
        self.request(url, Method::HEAD, retry_count, None).await
    }

    pub async fn request(
        &self,
        url: &str,
        method: Method,
        retry_count: u32,
        read_timeout: Option<Duration>,
    ) -> Option<FetchedPage> {
        if !validate_url(&self.config, url) {
            warn!("Skipping invalid URL: {}", url);
            self.inc("skipped_urls");
            return None;
        }
        if is_blocked(&self.config, url) {
            debug!("Blocked URL pattern: {}", url);
            self.inc("skipped_urls");
            return None;
        }

        let head_mode = method == Method::HEAD;
        let canon = canonicalise(url);

        // Only throttle actual GETs, not HEAD probes.
        if !head_mode {
            let domain = normalise_domain(url);
            self.buckets.bucket_for(&domain).await.consume().await;

            if guard_contains(&canon) {
                warn!("Redirect loop detected - already fetched {}", url);
                self.inc("skipped_urls");
                return None;
            }
        }

        self.inc("total_requests");

        let mut page: Option<FetchedPage> = None;
        let mut last_status: Option<u16> = None;

        for attempt in 0..retry_count {
            match self.send_once(url, method.clone(), read_timeout, false).await {
                Ok(p) => {
                    page = Some(p);
                    break;
                }
                Err(failure) if failure.status == Some(429) => {
                    last_status = Some(429);
                    let backoff = RETRY_DELAY * f64::from(1u32 << attempt);
                    warn!(
                        "429 Too Many Requests for {}; backing off {:.1}s (attempt {}/{})",
                        url,
                        backoff,
                        attempt + 1,
                        retry_count
                    );
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    continue;
                }
                Err(failure) => {
                    last_status = failure.status.or(last_status);

                    // TLS fallback on the final attempt, when allowed.
                    if failure.tls && attempt + 1 >= retry_count && self.config.insecure_ssl {
                        debug!("TLS failed, retrying with verification off: {}", url);
                        if let Ok(p) =
                            self.send_once(url, method.clone(), read_timeout, true).await
                        {
                            page = Some(p);
                            break;
                        }
                    }

                    // www-prefix fallback.
                    if let Some(fallback) = with_www_prefix(url) {
                        debug!("Retrying with www-prefix: {}", fallback);
                        if let Ok(p) = self
                            .send_once(&fallback, method.clone(), read_timeout, false)
                            .await
                        {
                            page = Some(p);
                            break;
                        }
                    }

                    // https → http downgrade.
                    if let Some(downgraded) = with_http_scheme(url) {
                        debug!("Retrying over plain HTTP: {}", downgraded);
                        if let Ok(p) = self
                            .send_once(&downgraded, method.clone(), read_timeout, false)
                            .await
                        {
                            page = Some(p);
                            break;
                        }
                    }

                    if attempt + 1 < retry_count {
                        let backoff = RETRY_DELAY * f64::from(1u32 << attempt);
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }

        match &page {
            Some(p) => self.inc(&format!("status_{}", p.status)),
            None => match last_status {
                Some(status) => self.inc(&format!("status_{status}")),
                None => self.inc("status_no-response"),
            },
        }

        let page = page?;

        if !head_mode {
            // Record both the requested and the post-redirect canonical form
            // so loops through redirect targets are also broken.
            guard_insert(canon);
            guard_insert(canonicalise(page.url.as_str()));

            if self.config.debug_mode {
                self.dump_debug(url, &page).await;
            }
        }

        Some(page)
    }

    async fn send_once(
        &self,
        url: &str,
        method: Method,
        read_timeout: Option<Duration>,
        insecure: bool,
    ) -> Result<FetchedPage, FetchFailure> {
        let head_mode = method == Method::HEAD;
        let client = if insecure {
            self.insecure()
        } else {
            self.client_for(&normalise_domain(url)).await
        }
        .ok_or(FetchFailure { status: None, tls: false })?;

        let mut req = client
            .request(method.clone(), url)
            .header(USER_AGENT, antibot::random_user_agent(&self.config.user_agents));
        for (k, v) in antibot::stealth_headers() {
            req = req.header(k, v);
        }
        if let Some(t) = read_timeout {
            req = req.timeout(t);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                debug!("HTTP {} {} -> {}", method, url, status);
                if status == 429 {
                    return Err(FetchFailure { status: Some(429), tls: false });
                }
                if !(200..300).contains(&status) {
                    return Err(FetchFailure { status: Some(status), tls: false });
                }
                let final_url = resp.url().clone();
                let content_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_ascii_lowercase();
                let body = if head_mode {
                    Vec::new()
                } else {
                    resp.bytes()
                        .await
                        .map_err(|_| FetchFailure { status: Some(status), tls: false })?
                        .to_vec()
                };
                Ok(FetchedPage { url: final_url, status, content_type, body })
            }
            Err(err) => {
                debug!("Request error for {}: {}", url, err);
                Err(FetchFailure {
                    status: err.status().map(|s| s.as_u16()),
                    tls: is_tls_error(&err),
                })
            }
        }
    }

    /// Per-domain client with its own cookie jar; with proxies configured,
    /// one client per proxy instead, picked uniformly at random per request.
    async fn client_for(&self, domain: &str) -> Option<Client> {
        if !self.config.proxies.is_empty() {
            let pool = self.proxy_clients.get_or_init(|| {
                self.config
                    .proxies
                    .iter()
                    .filter_map(|p| self.build_client(Some(p), false))
                    .collect()
            });
            if pool.is_empty() {
                return None;
            }
            use rand::Rng;
            let mut rng = rand::rng();
            return Some(pool[rng.random_range(0..pool.len())].clone());
        }

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(domain) {
            return Some(client.clone());
        }
        let client = self.build_client(None, false)?;
        clients.insert(domain.to_string(), client.clone());
        Some(client)
    }

    fn insecure(&self) -> Option<Client> {
        self.insecure_client
            .get_or_init(|| self.build_client(None, true))
            .clone()
    }

    fn build_client(&self, proxy: Option<&str>, insecure: bool) -> Option<Client> {
        let mut builder = Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(
                self.config.max_redirects.max(1),
            ))
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.read_timeout)
            .danger_accept_invalid_certs(insecure);
        if let Some(p) = proxy {
            let proxy_url = if p.contains("://") {
                p.to_string()
            } else {
                format!("http://{p}")
            };
            match Proxy::all(&proxy_url) {
                Ok(px) => builder = builder.proxy(px),
                Err(e) => {
                    warn!("Skipping invalid proxy {}: {}", proxy_url, e);
                    return None;
                }
            }
        }
        builder.build().ok()
    }

    async fn dump_debug(&self, url: &str, page: &FetchedPage) {
        let Ok(parsed) = Url::parse(url) else { return };
        let host = parsed.host_str().unwrap_or("_");
        let path = parsed.path().trim_matches('/').replace('/', "_");
        let path = if path.is_empty() { "index".to_string() } else { path };
        let fname = self.config.debug_dir.join(format!("{host}_{path}.html"));
        if let Err(e) = tokio::fs::create_dir_all(&self.config.debug_dir).await {
            warn!("Failed to create debug dir: {}", e);
            return;
        }
        if let Err(e) = tokio::fs::write(&fname, &page.body).await {
            warn!("Failed to save debug dump for {}: {}", url, e);
        } else {
            debug!("Saved debug dump for {} -> {}", url, fname.display());
        }
    }

    fn inc(&self, key: &str) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        *stats.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn stats_snapshot(&self) -> HashMap<String, u64> {
        self.stats.lock().expect("stats lock poisoned").clone()
    }
}

fn with_www_prefix(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if host.starts_with("www.") {
        return None;
    }
    let mut rebuilt = parsed.clone();
    rebuilt.set_host(Some(&format!("www.{host}"))).ok()?;
    Some(rebuilt.to_string())
}

fn with_http_scheme(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "https" {
        return None;
    }
    let mut rebuilt = parsed.clone();
    rebuilt.set_scheme("http").ok()?;
    Some(rebuilt.to_string())
}

fn is_tls_error(err: &reqwest::Error) -> bool {
    let repr = format!("{err:?}").to_ascii_lowercase();
    repr.contains("certificate") || repr.contains("tls") || repr.contains("ssl")
}
