use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_DOMAIN_LEN: usize = 253;

/// A normalized hostname: lowercase, no trailing dot, validated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(Box<str>);

impl Domain {
    /// Normalizes and validates `raw`. Returns None for anything that is
    /// not a plain hostname.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if is_valid_domain(&lowered) {
            Some(Self(lowered.into_boxed_str()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    let valid_labels = labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    });

    // TLD must be alphabetic, at least two characters
    let tld_ok = labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.bytes().all(|b| b.is_ascii_lowercase()));

    valid_labels && tld_ok
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Domain {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Domain::parse(&value).ok_or_else(|| format!("invalid domain '{}'", value))
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0.into_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let d = Domain::parse("  Ads.Example.COM. ").unwrap();
        assert_eq!(d.as_str(), "ads.example.com");
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(Domain::parse("").is_none());
        assert!(Domain::parse("localhost").is_none());
        assert!(Domain::parse("bad domain.com").is_none());
        assert!(Domain::parse("-lead.example.com").is_none());
        assert!(Domain::parse("example.c0m").is_none());
        assert!(Domain::parse("a..b.com").is_none());
        assert!(Domain::parse(&format!("{}.com", "a".repeat(260))).is_none());
    }

    #[test]
    fn test_accepts_hyphens_and_digits() {
        assert!(Domain::parse("ad-server01.tracker-net.io").is_some());
        assert!(Domain::parse("1e100.net").is_some());
    }
}
