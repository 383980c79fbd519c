//! Static email extraction: regex scan over deobfuscated text, plus explicit
//! `mailto:` handling, with cleaning and validation tuned for low false
//! positives.

use std::collections::HashSet;
use std::sync::OnceLock;

use fancy_regex::Regex as FancyRegex;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use super::decoders;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("invalid email format: {0}")]
    Format(String),
    #[error("invalid email after cleaning: {0}")]
    Validation(String),
}

fn email_re() -> &'static FancyRegex {
    static RE: OnceLock<FancyRegex> = OnceLock::new();
    RE.get_or_init(|| {
        FancyRegex::new(
            r"(?i)(?<![A-Z0-9._%+-])[A-Z0-9._%+-]+@(?:[A-Z0-9-]+\.)+[A-Z]{2,63}(?![A-Z0-9._%+-])",
        )
        .expect("email regex")
    })
}

fn obfuscated_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?P<user>[A-Za-z0-9._%+-]+)\s*(?:\[\s*at\s*\]|\(\s*at\s*\)|\bat\b)\s*(?P<host>[A-Za-z0-9-]+(?:\s*(?:\[\s*dot\s*\]|\(\s*dot\s*\)|\bdot\b)\s*[A-Za-z0-9-]+)+)",
        )
        .expect("obfuscated email regex")
    })
}

fn obfuscated_dot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\[\s*dot\s*\]|\(\s*dot\s*\)|\bdot\b").expect("obfuscated dot regex")
    })
}

fn suspicious_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:noreply|donotreply|no-reply|webmaster|hostmaster|postmaster)@")
            .expect("suspicious regex")
    })
}

fn asset_ext_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.(?:png|jpe?g|gif)$").expect("asset ext regex"))
}

fn long_hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[0-9a-f]{20,}$").expect("long hex regex"))
}

/// Throwaway/placeholder domains never worth emitting.
const DOMAIN_BLACKLIST: &[&str] = &[
    "example.com",
    "test.com",
    "domain.com",
    "email.com",
    "yourcompany.com",
    "company.com",
    "localhost",
];

pub struct EmailExtractor {
    /// Skip the placeholder-domain blacklist (integration fixtures live on
    /// reserved domains).
    skip_blacklist: bool,
}

impl Default for EmailExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailExtractor {
    pub fn new() -> Self {
        Self {
            skip_blacklist: std::env::var("LEADSCOUT_TEST_MODE").is_ok(),
        }
    }

    /// Rewrite `user [at] host [dot] tld` forms into real addresses so the
    /// main regex can pick them up.
    pub fn deobfuscate(text: &str) -> String {
        obfuscated_re()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let user = &caps["user"];
                let host = obfuscated_dot_re().replace_all(&caps["host"], ".");
                let host: String = host.split_whitespace().collect::<Vec<_>>().join("");
                format!("{user}@{host}")
            })
            .into_owned()
    }

    pub fn is_valid(&self, email: &str) -> bool {
        let Some((local, host)) = email.rsplit_once('@') else {
            return false;
        };
        if local.is_empty() || local.len() > 64 {
            return false;
        }
        if host.is_empty() || host.len() > 255 || !host.contains('.') {
            return false;
        }
        if !self.skip_blacklist && DOMAIN_BLACKLIST.contains(&host.to_ascii_lowercase().as_str()) {
            return false;
        }
        if suspicious_re().is_match(email) {
            return false;
        }
        for part in [local, host] {
            if asset_ext_re().is_match(part) || long_hex_re().is_match(part) {
                return false;
            }
        }
        true
    }

    /// Normalise a raw candidate: trim, strip `mailto:`, cut at `?`, strip
    /// trailing punctuation from the host, IDNA-decode, lowercase, validate.
    pub fn clean(&self, raw: &str) -> Result<String, EmailError> {
        let mut email = raw.trim().to_string();
        if email
            .get(..7)
            .map(|p| p.eq_ignore_ascii_case("mailto:"))
            .unwrap_or(false)
        {
            email = email[7..].to_string();
        }
        if let Some(idx) = email.find('?') {
            email.truncate(idx);
        }

        let Some((user, host)) = email.rsplit_once('@') else {
            return Err(EmailError::Format(raw.to_string()));
        };

        let host = host
            .trim()
            .trim_end_matches(['%', ';', ',', ':', ')', '}', ']', '>', '"', '\'', '`']);
        let (decoded, idna_result) = idna::domain_to_unicode(host);
        let host = if idna_result.is_ok() && !decoded.is_empty() {
            decoded
        } else {
            host.to_string()
        };

        let cleaned = format!("{user}@{host}").to_lowercase();
        if !self.is_valid(&cleaned) {
            return Err(EmailError::Validation(cleaned));
        }
        Ok(cleaned)
    }

    /// Single regex pass over deobfuscated plain text.
    pub fn extract_from_text(&self, text: &str) -> HashSet<String> {
        let mut hits = HashSet::new();
        if text.is_empty() {
            return hits;
        }
        let text = Self::deobfuscate(text);
        for m in email_re().find_iter(&text).flatten() {
            match self.clean(m.as_str()) {
                Ok(email) => {
                    hits.insert(email);
                }
                Err(e) => debug!("Dropped email candidate {}: {}", m.as_str(), e),
            }
        }
        hits
    }

    /// Scan the document's visible text, then `mailto:` hrefs explicitly.
    /// Raw and cleaned forms are each deduplicated.
    pub fn extract_from_html(&self, html: &str) -> HashSet<String> {
        let mut hits = HashSet::new();
        let mut seen_raw: HashSet<String> = HashSet::new();

        let (page_text, mailto_hrefs) = {
            let doc = Html::parse_document(html);
            let text = doc.root_element().text().collect::<Vec<_>>().join(" ");
            let anchor_sel = Selector::parse("a[href]").expect("anchor selector");
            let mailtos: Vec<String> = doc
                .select(&anchor_sel)
                .filter_map(|a| a.value().attr("href"))
                .filter(|href| {
                    href.get(..7)
                        .map(|p| p.eq_ignore_ascii_case("mailto:"))
                        .unwrap_or(false)
                })
                .map(|href| {
                    let raw = &href[7..];
                    raw.split('?').next().unwrap_or(raw).to_string()
                })
                .collect();
            (text, mailtos)
        };

        let page_text = Self::deobfuscate(&page_text);
        for m in email_re().find_iter(&page_text).flatten() {
            let raw = m.as_str().to_string();
            if !seen_raw.insert(raw.clone()) {
                continue;
            }
            match self.clean(&raw) {
                Ok(email) => {
                    hits.insert(email);
                }
                Err(e) => debug!("Dropped email candidate {}: {}", raw, e),
            }
        }

        for raw in mailto_hrefs {
            if !seen_raw.insert(raw.clone()) {
                continue;
            }
            match self.clean(&raw) {
                Ok(email) => {
                    hits.insert(email);
                }
                Err(e) => debug!("Dropped mailto candidate {}: {}", raw, e),
            }
        }

        hits
    }

    /// Decode `data-cfemail` attributes and clean the results. Non-empty
    /// output short-circuits the rest of the static pass.
    pub fn extract_cfemail(&self, html: &str) -> HashSet<String> {
        let attrs: Vec<String> = {
            let doc = Html::parse_document(html);
            let sel = Selector::parse("[data-cfemail]").expect("cfemail selector");
            doc.select(&sel)
                .filter_map(|el| el.value().attr("data-cfemail"))
                .map(|v| v.to_string())
                .collect()
        };
        attrs
            .iter()
            .filter_map(|cf| decoders::decode_cfemail(cf))
            .filter_map(|raw| self.clean(&raw).ok())
            .collect()
    }
}
