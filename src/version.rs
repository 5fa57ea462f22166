// src/version.rs

//! Package version parsing and comparison
//!
//! Versions are dotted token strings (`1.10.2`, `2.0.rc1`). Each token splits
//! into runs of digits and runs of other characters (`1a` is `1`, `a`), and
//! runs are compared left to right: digits as numbers, text as text, and a
//! numeric run is newer than a text run. When one version or token is a prefix
//! of the other, the longer one is newer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed, comparable version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    original: String,
    tokens: Vec<Vec<Segment>>,
}

/// Variant order matters: text runs sort below numeric runs
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Text(String),
    Numeric(u64),
}

impl Version {
    /// Parse a dotted version string
    pub fn parse(version: &str) -> Result<Self> {
        let trimmed = version.trim();
        if trimmed.is_empty() {
            return Err(Error::ParseError("empty version string".to_string()));
        }

        let tokens = trimmed.split('.').map(segments).collect();

        Ok(Self {
            original: trimmed.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }
}

/// Split one dotted token into digit and non-digit runs
fn segments(token: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = token;
    while let Some(first) = rest.chars().next() {
        let numeric = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != numeric)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);
        segments.push(match run.parse::<u64>() {
            Ok(n) if numeric => Segment::Numeric(n),
            _ => Segment::Text(run.to_string()),
        });
        rest = tail;
    }
    segments
}

impl Ord for Version {
    // Lexicographic over tokens, each token lexicographic over its runs;
    // slice ordering already makes the longer of two prefixes the greater
    fn cmp(&self, other: &Self) -> Ordering {
        self.tokens.cmp(&other.tokens)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.original
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_numeric_tokens_compare_as_numbers() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2.0") > v("1.99.99"));
        assert_eq!(v("1.0"), v("1.00"));
    }

    #[test]
    fn test_longer_version_is_newer() {
        assert!(v("1.0.1") > v("1.0"));
        assert!(v("1") < v("1.0"));
    }

    #[test]
    fn test_text_tokens() {
        assert!(v("1.0.rc2") > v("1.0.rc1"));
        assert!(v("1.a") < v("1.b"));
    }

    #[test]
    fn test_mixed_tokens_split_into_runs() {
        assert!(v("1.1a") > v("1.1"));
        assert!(v("1.1a") < v("1.2"));
        assert!(v("1.10") > v("1.1a"));
        assert!(v("1.9") > v("1.1a"));
        assert!(v("2.0rc1") < v("2.0rc2"));
        // A numeric run is newer than a text run in the same position
        assert!(v("1.0") > v("1.rc"));
    }

    #[test]
    fn test_order_is_total_over_mixed_versions() {
        let versions: Vec<Version> = [
            "1.9", "1.10", "1.1a", "1.1", "1.a", "1.rc1", "1.0.rc2", "1.0", "1.00", "2",
            "1.1b2", "1.1b10", "1.x9", "10a", "9z",
        ]
        .iter()
        .map(|s| v(s))
        .collect();

        for a in &versions {
            for b in &versions {
                assert_eq!(a.cmp(b), b.cmp(a).reverse(), "{} vs {}", a, b);
                for c in &versions {
                    if a <= b && b <= c {
                        assert!(a <= c, "{} <= {} <= {} but not {} <= {}", a, b, c, a, c);
                    }
                }
            }
        }

        let mut forward = versions.clone();
        forward.sort();
        let mut backward: Vec<Version> = versions.iter().rev().cloned().collect();
        backward.sort();
        for (a, b) in forward.iter().zip(&backward) {
            assert_eq!(a.cmp(b), Ordering::Equal, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_empty_version_rejected() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("   ").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let version: Version = serde_json::from_str("\"3.2.1\"").unwrap();
        assert_eq!(version, v("3.2.1"));
        assert_eq!(serde_json::to_string(&version).unwrap(), "\"3.2.1\"");
    }
}
