//! Custom-search client: single-flight pacing across the whole process,
//! retry with exponential backoff, typed errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::core::{Config, SearchHit};

const MAX_RESULTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search API error (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search rate limit exceeded for '{0}'")]
    RateLimitExceeded(String),
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchHit>,
}

pub struct SearchClient {
    config: Arc<Config>,
    client: reqwest::Client,
    /// Instant of the last outbound call; `None` until the first one.
    last_call: Mutex<Option<Instant>>,
}

impl SearchClient {
    pub fn new(config: Arc<Config>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .expect("search client construction");
        Self {
            config,
            client,
            last_call: Mutex::new(None),
        }
    }

    /// Sleep whatever is left of the safe interval. The wait is computed
    /// under the lock, the sleep happens outside it, and the timestamp is
    /// updated after the call completes.
    async fn respect_rate(&self) {
        let wait = {
            let last = self.last_call.lock().await;
            last.map(|t| {
                let interval = Duration::from_secs_f64(self.config.google_safe_interval);
                interval.saturating_sub(t.elapsed())
            })
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                debug!("Search pacing: waiting {:.2}s", wait.as_secs_f64());
                tokio::time::sleep(wait).await;
            }
        }
    }

    async fn mark_called(&self) {
        *self.last_call.lock().await = Some(Instant::now());
    }

    /// Up to `num_results` (≤ 10) hits for `query`. Retries 403/429 and
    /// timeouts with exponential backoff; other failures surface typed.
    pub async fn search(
        &self,
        query: &str,
        num_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if query.is_empty() {
            warn!("Empty search query");
            return Ok(Vec::new());
        }
        let num_results = num_results.min(MAX_RESULTS);

        for attempt in 0..self.config.google_max_retries {
            self.respect_rate().await;

            let num = num_results.to_string();
            let result = self
                .client
                .get(&self.config.search_endpoint)
                .query(&[
                    ("key", self.config.api_key.as_str()),
                    ("cx", self.config.cx_id.as_str()),
                    ("q", query),
                    ("num", num.as_str()),
                ])
                .send()
                .await;
            self.mark_called().await;

            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 403 || status == 429 {
                        let backoff = Duration::from_secs(1u64 << attempt);
                        warn!(
                            "Search quota {} - sleeping {}s (attempt {}/{})",
                            status,
                            backoff.as_secs(),
                            attempt + 1,
                            self.config.google_max_retries
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    if !(200..300).contains(&status) {
                        let body = resp.text().await.unwrap_or_default();
                        error!("Search API error (status {}): {}", status, body);
                        return Err(SearchError::Api { status, body });
                    }
                    let parsed: SearchResponse = resp.json().await?;
                    debug!("Search '{}' returned {} hits", query, parsed.items.len());
                    return Ok(parsed.items);
                }
                Err(e) if e.is_timeout() && attempt + 1 < self.config.google_max_retries => {
                    let backoff = Duration::from_secs(1u64 << attempt);
                    warn!(
                        "Search timed out on '{}' (attempt {}/{}), retrying in {}s",
                        query,
                        attempt + 1,
                        self.config.google_max_retries,
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(e) => {
                    error!("Search transport error: {}", e);
                    return Err(SearchError::Transport(e));
                }
            }
        }

        error!(
            "Search failed for '{}' after {} retries",
            query, self.config.google_max_retries
        );
        Err(SearchError::RateLimitExceeded(query.to_string()))
    }

    /// Like [`search`](Self::search) but errors collapse to an empty list.
    pub async fn search_with_fallback(&self, query: &str) -> Vec<SearchHit> {
        match self.search(query, MAX_RESULTS).await {
            Ok(hits) => hits,
            Err(e) => {
                error!("Search failed with fallback: {}", e);
                Vec::new()
            }
        }
    }
}
