use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One hit from the custom-search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "displayLink")]
    pub display_link: String,
}

/// One output row. `email` is empty for domain-only rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LeadRow {
    #[serde(rename = "Company")]
    pub company: String,
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Email")]
    pub email: String,
}

/// Per-company / per-run counters. Merged up the pipeline; the field names
/// mirror the summary the run prints at the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub leads: u64,
    pub domain: u64,
    pub no_google: u64,
    pub domain_unclear: u64,
    pub domain_error: u64,
    pub skipped_domain: u64,
    pub sitemap: u64,
    pub with_email: u64,
    pub without_email: u64,
    pub google_error: u64,
    pub processing_error: u64,
}

impl RunStats {
    pub fn merge(&mut self, other: &RunStats) {
        self.leads += other.leads;
        self.domain += other.domain;
        self.no_google += other.no_google;
        self.domain_unclear += other.domain_unclear;
        self.domain_error += other.domain_error;
        self.skipped_domain += other.skipped_domain;
        self.sitemap += other.sitemap;
        self.with_email += other.with_email;
        self.without_email += other.without_email;
        self.google_error += other.google_error;
        self.processing_error += other.processing_error;
    }
}

/// Final report for a run: aggregated stats, deduplicated rows, HTTP counters.
#[derive(Debug)]
pub struct RunReport {
    pub stats: RunStats,
    pub rows: Vec<LeadRow>,
    pub http_stats: HashMap<String, u64>,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn unique_emails(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| !r.email.is_empty())
            .map(|r| r.email.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    fn http_requests(&self) -> u64 {
        self.http_stats.get("total_requests").copied().unwrap_or(0)
    }

    fn http_no_response(&self) -> u64 {
        self.http_stats.get("status_no-response").copied().unwrap_or(0)
    }

    fn http_errors(&self) -> u64 {
        self.http_stats
            .iter()
            .filter(|(k, _)| {
                k.strip_prefix("status_")
                    .and_then(|s| s.parse::<u16>().ok())
                    .map(|code| !(200..300).contains(&code))
                    .unwrap_or(false)
            })
            .map(|(_, v)| v)
            .sum()
    }

    /// The run-summary box, printed once at the end of every run.
    pub fn summary(&self) -> String {
        let s = &self.stats;
        format!(
            "\n+--------------------------------------------------+\n\
             | RUN SUMMARY                                      |\n\
             +--------------------------------------------------+\n\
             | Leads           : {:>5}\n\
             | Domain found    : {:>5}\n\
             | No search hits  : {:>5}\n\
             | Domain unclear  : {:>5}\n\
             | Domain skipped  : {:>5}\n\
             | Sitemap used    : {:>5}\n\
             | With e-mail     : {:>5}\n\
             | Without e-mail  : {:>5}\n\
             | Search errors   : {:>5}\n\
             | Process errors  : {:>5}\n\
             | Unique e-mails  : {:>5}\n\
             | HTTP requests   : {:>5}\n\
             | HTTP errors     : {:>5}\n\
             | HTTP no-resp    : {:>5}\n\
             | Runtime         : {:>7.1} s\n\
             +--------------------------------------------------+",
            s.leads,
            s.domain,
            s.no_google,
            s.domain_unclear,
            s.skipped_domain,
            s.sitemap,
            s.with_email,
            s.without_email,
            s.google_error,
            s.processing_error + s.domain_error,
            self.unique_emails(),
            self.http_requests(),
            self.http_errors(),
            self.http_no_response(),
            self.elapsed_secs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_merge_adds_fields() {
        let mut a = RunStats { leads: 1, with_email: 1, ..Default::default() };
        let b = RunStats { leads: 2, sitemap: 1, ..Default::default() };
        a.merge(&b);
        assert_eq!(a.leads, 3);
        assert_eq!(a.with_email, 1);
        assert_eq!(a.sitemap, 1);
    }

    #[test]
    fn unique_emails_ignores_domain_only_rows() {
        let report = RunReport {
            stats: RunStats::default(),
            rows: vec![
                LeadRow {
                    company: "A".into(),
                    domain: "a.example".into(),
                    email: "x@a.example".into(),
                },
                LeadRow {
                    company: "B".into(),
                    domain: "b.example".into(),
                    email: String::new(),
                },
                LeadRow {
                    company: "C".into(),
                    domain: "c.example".into(),
                    email: "x@a.example".into(),
                },
            ],
            http_stats: HashMap::new(),
            elapsed_secs: 0.0,
        };
        assert_eq!(report.unique_emails(), 1);
    }
}
