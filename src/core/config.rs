use std::path::PathBuf;
use std::time::Duration;

use crate::antibot;

// ---------------------------------------------------------------------------
// Config — process-wide immutable settings, env-var driven with CLI overrides
// ---------------------------------------------------------------------------

pub const ENV_API_KEY: &str = "GOOGLE_API_KEY";
pub const ENV_CX_ID: &str = "GOOGLE_CX_ID";
pub const ENV_API_ENDPOINT: &str = "GOOGLE_API_ENDPOINT";

const DEFAULT_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

const DEFAULT_PRIORITY_PARTS: &str =
    "contact,about,impress,impressum,kontakt,privacy,sales,investor,procurement,suppliers";

const DEFAULT_SITEMAP_FILENAMES: &[&str] = &[
    "sitemap.xml",
    "sitemap_index.xml",
    "sitemap-index.xml",
    "sitemap1.xml",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set (required)")]
    MissingCredential(&'static str),
    #[error("{name} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Immutable settings built once at startup. Everything except the two API
/// credentials has a default; limits are range-checked so a typo in the
/// environment fails the run before any request goes out.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub cx_id: String,
    /// Custom-search endpoint; overridable so tests can point it at a local server.
    pub search_endpoint: String,

    pub priority_tokens: Vec<String>,
    pub sitemap_filenames: Vec<String>,
    pub max_fallback_pages: usize,
    pub max_urls_per_sitemap: usize,

    pub max_workers: usize,
    pub crawl_workers: usize,

    pub google_safe_interval: f64,
    pub google_max_retries: u32,
    pub domain_score_threshold: i32,

    pub max_redirects: usize,
    pub max_url_length: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub min_crawl_delay: f64,
    pub max_crawl_delay: f64,

    /// Host suffixes never fetched (e.g. `facebook.com`).
    pub blocked_host_suffixes: Vec<String>,
    /// Path extensions never fetched (e.g. `.zip`). Leading dot included.
    pub blocked_extensions: Vec<String>,

    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,

    pub process_pdfs: bool,
    pub insecure_ssl: bool,
    pub save_domain_only: bool,

    pub debug_mode: bool,
    pub debug_dir: PathBuf,
}

impl Config {
    /// Build the config from the environment. Fatal on missing credentials or
    /// nonsensical limits; everything else falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key =
            env_str(ENV_API_KEY).ok_or(ConfigError::MissingCredential(ENV_API_KEY))?;
        let cx_id = env_str(ENV_CX_ID).ok_or(ConfigError::MissingCredential(ENV_CX_ID))?;

        let search_endpoint =
            env_str(ENV_API_ENDPOINT).unwrap_or_else(|| DEFAULT_SEARCH_ENDPOINT.to_string());

        let priority_tokens = csv_list(
            &env_str("PRIORITY_PATH_PARTS").unwrap_or_else(|| DEFAULT_PRIORITY_PARTS.to_string()),
        );

        let max_fallback_pages = bounded(
            "MAX_FALLBACK_PAGES",
            env_parse("MAX_FALLBACK_PAGES", 12.0),
            1.0,
            500.0,
        )? as usize;
        let max_urls_per_sitemap = bounded(
            "MAX_URLS_PER_SITEMAP",
            env_parse("MAX_URLS_PER_SITEMAP", 10_000.0),
            1.0,
            100_000.0,
        )? as usize;
        let max_workers =
            bounded("MAX_WORKERS", env_parse("MAX_WORKERS", 4.0), 1.0, 64.0)? as usize;
        let google_safe_interval = bounded(
            "GOOGLE_SAFE_INTERVAL",
            env_parse("GOOGLE_SAFE_INTERVAL", 0.8),
            0.1,
            10.0,
        )?;
        let google_max_retries = bounded(
            "GOOGLE_MAX_RETRIES",
            env_parse("GOOGLE_MAX_RETRIES", 5.0),
            1.0,
            10.0,
        )? as u32;
        let domain_score_threshold = bounded(
            "DOMAIN_SCORE_THRESHOLD",
            env_parse("DOMAIN_SCORE_THRESHOLD", 60.0),
            0.0,
            100.0,
        )? as i32;
        let max_redirects =
            bounded("MAX_REDIRECTS", env_parse("MAX_REDIRECTS", 5.0), 0.0, 100.0)? as usize;
        let max_url_length = bounded(
            "MAX_URL_LENGTH",
            env_parse("MAX_URL_LENGTH", 2_000.0),
            100.0,
            10_000.0,
        )? as usize;

        let connect_timeout = Duration::from_secs(env_parse("CONNECTION_TIMEOUT", 10.0) as u64);
        let read_timeout = Duration::from_secs(env_parse("READ_TIMEOUT", 20.0) as u64);

        let min_crawl_delay = env_parse("MIN_CRAWL_DELAY", 0.5);
        let max_crawl_delay = env_parse("MAX_CRAWL_DELAY", 2.0);
        if min_crawl_delay <= 0.0 || max_crawl_delay < min_crawl_delay {
            return Err(ConfigError::Invalid {
                name: "MIN_CRAWL_DELAY/MAX_CRAWL_DELAY",
                reason: format!(
                    "need 0 < min <= max, got min={min_crawl_delay} max={max_crawl_delay}"
                ),
            });
        }

        // BLOCKED_DOMAINS mixes host suffixes and path extensions; a leading
        // dot marks an extension. Split once here so the hot path never has
        // to re-classify patterns.
        let blocked = csv_list(&env_str("BLOCKED_DOMAINS").unwrap_or_default());
        let (blocked_extensions, blocked_host_suffixes): (Vec<String>, Vec<String>) =
            blocked.into_iter().partition(|p| p.starts_with('.'));

        let user_agents = match env_str("USER_AGENTS") {
            Some(raw) => {
                let list: Vec<String> = raw
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
                if list.is_empty() {
                    return Err(ConfigError::Invalid {
                        name: "USER_AGENTS",
                        reason: "set but empty".to_string(),
                    });
                }
                list
            }
            None => antibot::USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        };

        let proxies = csv_list(&env_str("PROXIES").unwrap_or_default());

        Ok(Self {
            api_key,
            cx_id,
            search_endpoint,
            priority_tokens,
            sitemap_filenames: DEFAULT_SITEMAP_FILENAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_fallback_pages,
            max_urls_per_sitemap,
            max_workers,
            crawl_workers: 4,
            google_safe_interval,
            google_max_retries,
            domain_score_threshold,
            max_redirects,
            max_url_length,
            connect_timeout,
            read_timeout,
            min_crawl_delay,
            max_crawl_delay,
            blocked_host_suffixes,
            blocked_extensions,
            user_agents,
            proxies,
            process_pdfs: env_flag("PROCESS_PDFS"),
            insecure_ssl: env_flag("ALLOW_INSECURE_SSL"),
            save_domain_only: false,
            debug_mode: env_flag("DEBUG_MODE"),
            debug_dir: PathBuf::from(
                env_str("DEBUG_DIR").unwrap_or_else(|| "debug_output".to_string()),
            ),
        })
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse(name: &str, default: f64) -> f64 {
    env_str(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    env_str(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

fn bounded(name: &'static str, value: f64, min: f64, max: f64) -> Result<f64, ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { name, value, min, max });
    }
    Ok(value)
}

/// A fully-defaulted config for tests; no environment reads.
pub fn test_config() -> Config {
    Config {
        api_key: "test-key".to_string(),
        cx_id: "test-cx".to_string(),
        search_endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
        priority_tokens: csv_list(DEFAULT_PRIORITY_PARTS),
        sitemap_filenames: DEFAULT_SITEMAP_FILENAMES
            .iter()
            .map(|s| s.to_string())
            .collect(),
        max_fallback_pages: 12,
        max_urls_per_sitemap: 10_000,
        max_workers: 4,
        crawl_workers: 4,
        google_safe_interval: 0.8,
        google_max_retries: 5,
        domain_score_threshold: 60,
        max_redirects: 5,
        max_url_length: 2_000,
        connect_timeout: Duration::from_secs(10),
        read_timeout: Duration::from_secs(20),
        min_crawl_delay: 0.5,
        max_crawl_delay: 2.0,
        blocked_host_suffixes: Vec::new(),
        blocked_extensions: Vec::new(),
        user_agents: antibot::USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        proxies: Vec::new(),
        process_pdfs: false,
        insecure_ssl: false,
        save_domain_only: false,
        debug_mode: false,
        debug_dir: PathBuf::from("debug_output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_list_trims_and_lowercases() {
        assert_eq!(
            csv_list(" Contact , ABOUT ,,privacy"),
            vec!["contact", "about", "privacy"]
        );
        assert!(csv_list("").is_empty());
    }

    #[test]
    fn bounded_rejects_out_of_range() {
        assert!(bounded("X", 0.0, 1.0, 500.0).is_err());
        assert!(bounded("X", 501.0, 1.0, 500.0).is_err());
        assert_eq!(bounded("X", 500.0, 1.0, 500.0).unwrap(), 500.0);
    }

    #[test]
    fn blocked_domains_split_by_dot_convention() {
        let blocked = csv_list(".pdf,facebook.com,.zip,tracker.example");
        let (ext, hosts): (Vec<String>, Vec<String>) =
            blocked.into_iter().partition(|p| p.starts_with('.'));
        assert_eq!(ext, vec![".pdf", ".zip"]);
        assert_eq!(hosts, vec!["facebook.com", "tracker.example"]);
    }

    #[test]
    fn crawl_delay_bounds_validated() {
        let cfg = test_config();
        assert!(cfg.min_crawl_delay > 0.0);
        assert!(cfg.min_crawl_delay <= cfg.max_crawl_delay);
    }
}
