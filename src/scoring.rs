//! Fuzzy scoring of candidate domains against company names.

use std::sync::Arc;

use tracing::debug;

use crate::core::{Config, SearchHit};
use crate::net;

/// Platforms that frequently outrank a company's own site in search results.
const PENALTY_HOSTS: &[&str] = &[
    "linkedin",
    "facebook",
    "instagram",
    "twitter",
    "youtube",
    "medium",
    "github",
    "glassdoor",
    "indeed",
    "crunchbase",
    "bloomberg",
    "wikipedia",
];

const SOCIAL_PENALTY: i32 = 25;
const MIN_COMPANY_LENGTH: usize = 3;
const NEUTRAL_SCORE: i32 = 50;

const LEGAL_SUFFIXES: &[&str] = &[
    " inc",
    " inc.",
    " incorporated",
    " llc",
    " ltd",
    " ltd.",
    " limited",
    " gmbh",
    " ag",
    " corp",
    " corp.",
    " corporation",
    " co",
    " co.",
];

/// Common multi-part public suffixes; enough to split the registrable label
/// for scoring (the full public-suffix list would be overkill here).
const MULTI_PART_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "com.au", "net.au", "org.au", "co.nz",
    "co.jp", "co.in", "co.kr", "co.za", "com.br", "com.mx", "com.ar", "com.cn", "com.sg",
    "com.tr", "com.hk", "com.tw",
];

#[derive(Debug, Clone)]
pub struct DomainScorer {
    config: Arc<Config>,
}

impl DomainScorer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Lowercase, strip one trailing legal suffix, drop non-alphanumerics.
    pub fn clean_company_name(company: &str) -> String {
        let mut cleaned = company.to_lowercase();
        for suffix in LEGAL_SUFFIXES {
            if cleaned.ends_with(suffix) {
                cleaned.truncate(cleaned.len() - suffix.len());
                break;
            }
        }
        cleaned.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
    }

    /// Relevance of `url` to `company` on [0, 100]. Deterministic.
    pub fn score_domain(&self, company: &str, url: &str) -> i32 {
        if company.is_empty() || url.is_empty() {
            return 0;
        }

        let host = net::normalise_domain(url);
        let base = Self::clean_company_name(company);
        if base.len() < MIN_COMPANY_LENGTH {
            debug!("Company name too short for reliable scoring: {}", company);
            return NEUTRAL_SCORE;
        }

        let penalty = if PENALTY_HOSTS.iter().any(|p| host.contains(p)) {
            SOCIAL_PENALTY
        } else {
            0
        };

        let (domain_label, subdomain) = registrable_parts(&host);
        let score = partial_ratio(&base, &domain_label).max(partial_ratio(&base, &subdomain));

        let final_score = (score - penalty).max(0);
        debug!(
            "Domain score for {} / {}: {} (raw {}, penalty {})",
            company, host, final_score, score, penalty
        );
        final_score
    }

    /// Best (score, link) over all hits; ties keep the first occurrence.
    pub fn find_best_domain(&self, company: &str, hits: &[SearchHit]) -> (i32, String) {
        let mut best: (i32, String) = (0, String::new());
        let mut have_best = false;
        for hit in hits {
            if hit.link.is_empty() {
                continue;
            }
            let score = self.score_domain(company, &hit.link);
            if !have_best || score > best.0 {
                best = (score, hit.link.clone());
                have_best = true;
            }
        }
        best
    }

    pub fn is_relevant(&self, company: &str, url: &str) -> bool {
        self.score_domain(company, url) >= self.config.domain_score_threshold
    }
}

/// Split a host into (second-level label, subdomain). `shop.acme.co.uk`
/// yields (`acme`, `shop`).
fn registrable_parts(host: &str) -> (String, String) {
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.is_empty() {
        return (String::new(), String::new());
    }
    if labels.len() == 1 {
        return (labels[0].to_string(), String::new());
    }

    let last_two = format!("{}.{}", labels[labels.len() - 2], labels[labels.len() - 1]);
    let sld_index = if labels.len() >= 3 && MULTI_PART_SUFFIXES.contains(&last_two.as_str()) {
        labels.len() - 3
    } else {
        labels.len() - 2
    };

    let domain_label = labels[sld_index].to_string();
    let subdomain = labels[..sld_index].join(".");
    (domain_label, subdomain)
}

/// Best normalized-similarity of the shorter string against any
/// equal-length window of the longer, scaled to [0, 100]. A substring match
/// scores 100.
fn partial_ratio(a: &str, b: &str) -> i32 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let long_chars: Vec<char> = long.chars().collect();
    let n = short.chars().count();

    let mut best = 0.0_f64;
    for start in 0..=(long_chars.len() - n) {
        let window: String = long_chars[start..start + n].iter().collect();
        let sim = strsim::normalized_levenshtein(short, &window);
        if sim > best {
            best = sim;
        }
        if best >= 1.0 {
            break;
        }
    }
    (best * 100.0).round() as i32
}
