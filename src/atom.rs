// src/atom.rs

//! Package atoms and dependency specifications
//!
//! An atom fully identifies an installable unit: `category/name-version`,
//! an optional `-rN` revision, a slot and an optional `#tag`. Dependency
//! specifications select atoms by key, version range, slot and tag.

use crate::error::{Error, Result};
use crate::version::Version;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Slot assigned when none is given
pub const DEFAULT_SLOT: &str = "0";

/// A fully-qualified package identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub category: String,
    pub name: String,
    pub version: Version,
    pub revision: u32,
    pub slot: String,
    pub tag: Option<String>,
}

/// Split trailing `#tag` and `:slot` qualifiers off an atom or spec string
fn split_qualifiers(s: &str) -> (&str, Option<&str>, Option<&str>) {
    let (rest, tag) = match s.rsplit_once('#') {
        Some((rest, tag)) => (rest, Some(tag)),
        None => (s, None),
    };
    let (rest, slot) = match rest.rsplit_once(':') {
        Some((rest, slot)) => (rest, Some(slot)),
        None => (rest, None),
    };
    (rest, slot, tag)
}

/// Validate a `category/name` key
fn parse_key(s: &str) -> Result<(String, String)> {
    let (category, name) = s
        .split_once('/')
        .ok_or_else(|| Error::ParseError(format!("Missing category in: {}", s)))?;

    let valid = |part: &str| {
        !part.is_empty()
            && !part.starts_with('-')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
    };
    if !valid(category) || !valid(name) {
        return Err(Error::ParseError(format!("Invalid package key: {}", s)));
    }

    Ok((category.to_string(), name.to_string()))
}

/// Parse `category/name-version[-rN]` into its parts
fn parse_versioned(s: &str) -> Result<(String, String, Version, u32)> {
    let (body, revision) = match s.rsplit_once("-r") {
        Some((body, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
            let revision = rev
                .parse::<u32>()
                .map_err(|_| Error::ParseError(format!("Invalid revision in: {}", s)))?;
            (body, revision)
        }
        _ => (s, 0),
    };

    // The version starts after the last hyphen that is followed by a valid version
    for (idx, _) in body.rmatch_indices('-') {
        let candidate = &body[idx + 1..];
        if let Ok(version) = Version::parse(candidate) {
            let (category, name) = parse_key(&body[..idx])?;
            return Ok((category, name, version, revision));
        }
    }

    Err(Error::ParseError(format!("Missing version in atom: {}", s)))
}

impl Atom {
    /// Create an atom in the default slot with revision 0
    pub fn new(category: &str, name: &str, version: &str) -> Result<Self> {
        parse_key(&format!("{}/{}", category, name))?;
        Ok(Self {
            category: category.to_string(),
            name: name.to_string(),
            version: Version::parse(version)?,
            revision: 0,
            slot: DEFAULT_SLOT.to_string(),
            tag: None,
        })
    }

    /// Parse `category/name-version[-rN][:slot][#tag]`
    pub fn parse(s: &str) -> Result<Self> {
        let (body, slot, tag) = split_qualifiers(s.trim());
        let (category, name, version, revision) = parse_versioned(body)?;

        Ok(Self {
            category,
            name,
            version,
            revision,
            slot: slot.unwrap_or(DEFAULT_SLOT).to_string(),
            tag: tag.filter(|t| !t.is_empty()).map(str::to_string),
        })
    }

    /// Package key (`category/name`), ignoring version
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// Atom including its slot (`category/name-version[-rN]:slot[#tag]`);
    /// unique within a store and accepted by `Atom::parse`
    pub fn qualified(&self) -> String {
        let mut s = format!("{}/{}-{}", self.category, self.name, self.version);
        if self.revision > 0 {
            s.push_str(&format!("-r{}", self.revision));
        }
        s.push(':');
        s.push_str(&self.slot);
        if let Some(tag) = &self.tag {
            s.push('#');
            s.push_str(tag);
        }
        s
    }

    /// Compare version and revision only
    pub fn cmp_version(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.revision.cmp(&other.revision))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.category, self.name, self.version)?;
        if self.revision > 0 {
            write!(f, "-r{}", self.revision)?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "#{}", tag)?;
        }
        Ok(())
    }
}

impl FromStr for Atom {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Atom::parse(s)
    }
}

/// Version operator of a dependency specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// No version constraint
    Any,
    Equal,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    /// `~`: same version, any revision
    AnyRevision,
    /// `=...*`: version prefix
    Prefix,
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Any => "",
            Operator::Equal | Operator::Prefix => "=",
            Operator::GreaterEqual => ">=",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
            Operator::AnyRevision => "~",
        }
    }
}

/// A dependency specification selecting one or more atoms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepSpec {
    pub blocker: bool,
    pub op: Operator,
    pub key: String,
    pub version: Option<Version>,
    pub revision: u32,
    pub slot: Option<String>,
    pub tag: Option<String>,
}

impl DepSpec {
    /// Parse `[!][op]category/name[-version][*][:slot][#tag]`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (blocker, s) = match s.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (body, slot, tag) = split_qualifiers(s);

        let (op, body) = [
            (">=", Operator::GreaterEqual),
            ("<=", Operator::LessEqual),
            ("=", Operator::Equal),
            ("~", Operator::AnyRevision),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ]
        .iter()
        .find_map(|(prefix, op)| body.strip_prefix(prefix).map(|rest| (*op, rest)))
        .unwrap_or((Operator::Any, body));

        let slot = slot.filter(|s| !s.is_empty()).map(str::to_string);
        let tag = tag.filter(|t| !t.is_empty()).map(str::to_string);

        if op == Operator::Any {
            let (category, name) = parse_key(body)?;
            return Ok(Self {
                blocker,
                op,
                key: format!("{}/{}", category, name),
                version: None,
                revision: 0,
                slot,
                tag,
            });
        }

        let (op, body) = match body.strip_suffix('*') {
            Some(rest) if op == Operator::Equal => (Operator::Prefix, rest),
            Some(_) => {
                return Err(Error::ParseError(format!(
                    "Wildcard only allowed with '=': {}",
                    s
                )));
            }
            None => (op, body),
        };

        let (category, name, version, revision) = parse_versioned(body)?;
        Ok(Self {
            blocker,
            op,
            key: format!("{}/{}", category, name),
            version: Some(version),
            revision,
            slot,
            tag,
        })
    }

    /// Whether `atom` satisfies this specification (ignoring the blocker flag)
    pub fn matches(&self, atom: &Atom) -> bool {
        if self.key != atom.key() {
            return false;
        }
        if let Some(slot) = &self.slot {
            if slot != &atom.slot {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if atom.tag.as_ref() != Some(tag) {
                return false;
            }
        }

        let Some(version) = &self.version else {
            return true;
        };

        let ord = atom
            .version
            .cmp(version)
            .then(atom.revision.cmp(&self.revision));

        match self.op {
            Operator::Any => true,
            Operator::Equal => ord == Ordering::Equal,
            Operator::GreaterEqual => ord != Ordering::Less,
            Operator::LessEqual => ord != Ordering::Greater,
            Operator::Greater => ord == Ordering::Greater,
            Operator::Less => ord == Ordering::Less,
            Operator::AnyRevision => atom.version == *version,
            Operator::Prefix => version_prefix(atom.version.as_str(), version.as_str()),
        }
    }
}

/// `=pkg-3.1*` matches 3.1, 3.1.2, 3.1_rc1 and 3.1a but not 3.11
fn version_prefix(version: &str, prefix: &str) -> bool {
    let Some(rest) = version.strip_prefix(prefix) else {
        return false;
    };
    match rest.chars().next() {
        None | Some('.' | '_' | '-') => true,
        Some(c) => c.is_ascii_alphabetic() && prefix.ends_with(|p: char| p.is_ascii_digit()),
    }
}

impl fmt::Display for DepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blocker {
            f.write_str("!")?;
        }
        f.write_str(self.op.as_str())?;
        f.write_str(&self.key)?;
        if let Some(version) = &self.version {
            write!(f, "-{}", version)?;
            if self.revision > 0 {
                write!(f, "-r{}", self.revision)?;
            }
            if self.op == Operator::Prefix {
                f.write_str("*")?;
            }
        }
        if let Some(slot) = &self.slot {
            write!(f, ":{}", slot)?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "#{}", tag)?;
        }
        Ok(())
    }
}

impl FromStr for DepSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DepSpec::parse(s)
    }
}
