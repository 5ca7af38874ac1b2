// src/version.rs

//! Package version parsing and ordering
//!
//! Versions follow the Gentoo layout used by Entropy repositories:
//! dotted numeric components, an optional trailing letter and any number of
//! `_alpha`, `_beta`, `_pre`, `_rc` or `_p` suffixes (each with an optional
//! number). Revisions (`-rN`) belong to the atom, not the version.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Version suffix, ordered from oldest to newest release stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Suffix {
    Alpha,
    Beta,
    Pre,
    Rc,
    Patch,
}

impl Suffix {
    pub fn as_str(&self) -> &str {
        match self {
            Suffix::Alpha => "alpha",
            Suffix::Beta => "beta",
            Suffix::Pre => "pre",
            Suffix::Rc => "rc",
            Suffix::Patch => "p",
        }
    }
}

impl FromStr for Suffix {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "alpha" => Ok(Suffix::Alpha),
            "beta" => Ok(Suffix::Beta),
            "pre" => Ok(Suffix::Pre),
            "rc" => Ok(Suffix::Rc),
            "p" => Ok(Suffix::Patch),
            _ => Err(format!("Invalid version suffix: {}", s)),
        }
    }
}

/// A parsed package version
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<String>,
    letter: Option<char>,
    suffixes: Vec<(Suffix, u64)>,
}

impl Version {
    /// Parse a version string such as `1.2.3b_rc1`
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::ParseError(format!("Invalid version: {}", s));

        let mut parts = s.split('_');
        let head = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

        let (numbers, letter) = match head.chars().last() {
            Some(c) if c.is_ascii_lowercase() => (&head[..head.len() - 1], Some(c)),
            _ => (head, None),
        };

        let components: Vec<String> = numbers.split('.').map(str::to_string).collect();
        if components
            .iter()
            .any(|c| c.is_empty() || !c.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid());
        }

        let mut suffixes = Vec::new();
        for part in parts {
            let split = part
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(part.len());
            let (name, number) = part.split_at(split);
            let suffix = name.parse::<Suffix>().map_err(|_| invalid())?;
            let number = if number.is_empty() {
                0
            } else {
                number.parse::<u64>().map_err(|_| invalid())?
            };
            suffixes.push((suffix, number));
        }

        Ok(Self {
            raw: s.to_string(),
            components,
            letter,
            suffixes,
        })
    }

    /// The version exactly as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Compare two dotted components; the first is always numeric, later ones
/// with a leading zero compare as decimal fractions
fn compare_component(index: usize, a: &str, b: &str) -> Ordering {
    if index > 0 && (a.starts_with('0') || b.starts_with('0')) {
        let a = a.trim_end_matches('0');
        let b = b.trim_end_matches('0');
        return a.cmp(b);
    }

    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (i, (a, b)) in self.components.iter().zip(&other.components).enumerate() {
            let ord = compare_component(i, a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        let ord = self.components.len().cmp(&other.components.len());
        if ord != Ordering::Equal {
            return ord;
        }

        let ord = self.letter.cmp(&other.letter);
        if ord != Ordering::Equal {
            return ord;
        }

        for (a, b) in self.suffixes.iter().zip(&other.suffixes) {
            let ord = a.cmp(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        // A trailing `_p` is newer than no suffix, every other suffix older
        let common = self.suffixes.len().min(other.suffixes.len());
        match (self.suffixes.get(common), other.suffixes.get(common)) {
            (Some((Suffix::Patch, _)), None) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (None, Some((Suffix::Patch, _))) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        }
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

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2") > v("1.99.99"));
        assert!(v("1.2.3") > v("1.2"));
        assert_eq!(v("1.2"), v("1.2"));
    }

    #[test]
    fn test_leading_zero_components() {
        assert!(v("1.01") < v("1.1"));
        assert!(v("1.010") == v("1.01"));
    }

    #[test]
    fn test_letter_and_suffixes() {
        assert!(v("1.2b") > v("1.2a"));
        assert!(v("1.2a") > v("1.2"));
        assert!(v("1.0_alpha") < v("1.0_beta"));
        assert!(v("1.0_rc2") < v("1.0"));
        assert!(v("1.0_p1") > v("1.0"));
        assert!(v("1.0_rc1") < v("1.0_rc2"));
    }

    #[test]
    fn test_invalid_versions() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1..2").is_err());
        assert!(Version::parse("1.x").is_err());
        assert!(Version::parse("1.0_gamma").is_err());
    }

    #[test]
    fn test_display_keeps_raw_form() {
        assert_eq!(v("3.0_rc1").to_string(), "3.0_rc1");
    }
}
