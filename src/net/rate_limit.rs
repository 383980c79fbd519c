//! Per-domain token-bucket pacing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `rate` tokens/sec accrue up to `capacity`. `consume` takes
/// one token, sleeping the minimal wait when the bucket is short.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate: rate_per_sec,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token, blocking for the shortfall if necessary. The sleep
    /// happens outside the lock so concurrent callers on other domains are
    /// never held up.
    pub async fn consume(&self) {
        let wait = {
            let mut st = self.state.lock().await;
            let now = Instant::now();
            let delta = now.duration_since(st.last_refill).as_secs_f64() * self.rate;
            st.tokens = (st.tokens + delta).min(self.capacity);
            st.last_refill = now;

            if st.tokens >= 1.0 {
                st.tokens -= 1.0;
                None
            } else {
                let needed = 1.0 - st.tokens;
                st.tokens = 0.0;
                Some(Duration::from_secs_f64(needed / self.rate))
            }
        };

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Lazily-created bucket per domain. Rate and capacity derive from the crawl
/// delays: rate = 1/min_delay, capacity = max_delay/min_delay.
pub struct DomainBuckets {
    rate: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl DomainBuckets {
    pub fn new(min_crawl_delay: f64, max_crawl_delay: f64) -> Self {
        Self {
            rate: 1.0 / min_crawl_delay,
            capacity: max_crawl_delay / min_crawl_delay,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn bucket_for(&self, domain: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.rate, self.capacity)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_of_capacity_passes_without_blocking() {
        let bucket = TokenBucket::new(10.0, 4.0);
        let start = Instant::now();
        for _ in 0..4 {
            bucket.consume().await;
        }
        // Full capacity available up front; nothing should sleep.
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn next_request_blocks_at_most_one_interval() {
        let bucket = TokenBucket::new(20.0, 2.0);
        bucket.consume().await;
        bucket.consume().await;
        let start = Instant::now();
        bucket.consume().await;
        let waited = start.elapsed();
        // 1/rate = 50ms; allow generous epsilon for the test runner.
        assert!(waited >= Duration::from_millis(30), "waited {waited:?}");
        assert!(waited < Duration::from_millis(200), "waited {waited:?}");
    }

    #[tokio::test]
    async fn buckets_are_per_domain() {
        let buckets = DomainBuckets::new(0.5, 2.0);
        let a = buckets.bucket_for("a.example").await;
        let a2 = buckets.bucket_for("a.example").await;
        let b = buckets.bucket_for("b.example").await;
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
