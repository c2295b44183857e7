//! Output redaction — masks configured secret patterns in captured chunks
//! and event payloads before delivery (spec.md §4.10).
//!
//! One combined matcher is built at configuration time and applied at chunk
//! boundaries, per the "Redaction on the hot path" design note — this
//! avoids leaking half of a secret split across two flushes.

use regex::{Regex, RegexSet};

pub const REDACTED_TOKEN: &str = "[REDACTED]";

/// A compiled set of secret patterns plus the individual `Regex`es needed to
/// actually perform the substring replacement (`RegexSet` alone only tells
/// you *which* patterns matched, not where).
#[derive(Clone)]
pub struct Redactor {
    set: Option<RegexSet>,
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        if patterns.is_empty() {
            return Ok(Self { set: None, patterns: Vec::new() });
        }
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let set = RegexSet::new(patterns)?;
        Ok(Self { set: Some(set), patterns: compiled })
    }

    pub fn empty() -> Self {
        Self { set: None, patterns: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_none()
    }

    /// Redact a single chunk of text, replacing every match of any
    /// configured pattern with [`REDACTED_TOKEN`].
    pub fn redact(&self, text: &str) -> String {
        let Some(set) = &self.set else {
            return text.to_string();
        };
        if !set.is_match(text) {
            return text.to_string();
        }
        let mut out = text.to_string();
        for re in &self.patterns {
            out = re.replace_all(&out, REDACTED_TOKEN).into_owned();
        }
        out
    }

    pub fn redact_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        if self.is_empty() {
            return bytes.to_vec();
        }
        match std::str::from_utf8(bytes) {
            Ok(s) => self.redact(s).into_bytes(),
            Err(_) => bytes.to_vec(),
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_matching_substrings() {
        let r = Redactor::new(&["sk-[a-zA-Z0-9]+".to_string()]).unwrap();
        let out = r.redact("token=sk-abc123 ok");
        assert_eq!(out, "token=[REDACTED] ok");
    }

    #[test]
    fn passthrough_when_no_patterns() {
        let r = Redactor::empty();
        assert_eq!(r.redact("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn leaves_non_matching_text_untouched() {
        let r = Redactor::new(&["password=\\S+".to_string()]).unwrap();
        assert_eq!(r.redact("hello world"), "hello world");
    }
}
