//! Obfuscation decoders. Each transformer produces additional candidate text
//! that gets concatenated into the pool the email regex scans; they are
//! independent and individually testable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

fn char_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"fromCharCode\(([^)]+)\)").expect("charcode regex"))
}

fn alpha_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z]{30,}").expect("alpha block regex"))
}

fn base64_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'([A-Za-z0-9+/=]{40,})'").expect("base64 regex"))
}

/// Decode a Cloudflare `data-cfemail` hex string: the first byte is the XOR
/// key, each following byte XORed with it yields one output char.
pub fn decode_cfemail(cf: &str) -> Option<String> {
    if cf.len() < 4 || cf.len() % 2 != 0 {
        return None;
    }
    let bytes: Vec<u8> = (0..cf.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cf[i..i + 2], 16))
        .collect::<Result<_, _>>()
        .ok()?;
    let key = bytes[0];
    let decoded: Vec<u8> = bytes[1..].iter().map(|b| b ^ key).collect();
    String::from_utf8(decoded).ok()
}

/// Inverse of [`decode_cfemail`]; used by round-trip tests.
pub fn encode_cfemail(plain: &str, key: u8) -> String {
    let mut out = format!("{key:02x}");
    for b in plain.bytes() {
        out.push_str(&format!("{:02x}", b ^ key));
    }
    out
}

/// Decode every `fromCharCode(n1, n2, ...)` call in `html` into a string.
pub fn from_char_code_candidates(html: &str) -> Vec<String> {
    char_code_re()
        .captures_iter(html)
        .filter_map(|cap| {
            let decoded: String = cap[1]
                .split(',')
                .filter_map(|n| n.trim().parse::<u32>().ok())
                .filter_map(char::from_u32)
                .collect();
            if decoded.is_empty() { None } else { Some(decoded) }
        })
        .collect()
}

/// ROT13 transforms of contiguous alphabetic blocks of at least 30 chars.
pub fn rot13_candidates(html: &str) -> Vec<String> {
    alpha_block_re()
        .find_iter(html)
        .map(|m| rot13(m.as_str()))
        .collect()
}

pub fn rot13(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'a'..='z' => (b'a' + (c as u8 - b'a' + 13) % 26) as char,
            'A'..='Z' => (b'A' + (c as u8 - b'A' + 13) % 26) as char,
            other => other,
        })
        .collect()
}

/// UTF-8 decodings of single-quoted base64 runs of at least 40 chars.
pub fn base64_candidates(html: &str) -> Vec<String> {
    base64_re()
        .captures_iter(html)
        .filter_map(|cap| {
            let bytes = BASE64.decode(&cap[1]).ok()?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        })
        .collect()
}

/// HTML-entity unescape (named, decimal and hex entities).
pub fn unescape_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}
