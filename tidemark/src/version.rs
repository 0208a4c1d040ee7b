use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// An ordered migration version identifier: a dot-separated sequence of
/// non-negative integers, compared lexicographically with shorter keys padded
/// by zeros, so `1.0` and `1` are the same version.
///
/// Keys are stored in canonical form (trailing zero parts stripped), which
/// lets equality, ordering and hashing all derive from the part vector.
///
/// ```
/// use tidemark::VersionKey;
///
/// let a: VersionKey = "1.0".parse().unwrap();
/// let b: VersionKey = "1".parse().unwrap();
/// assert_eq!(a, b);
/// assert!(a < "1.1".parse().unwrap());
/// assert_eq!("2.0.3".parse::<VersionKey>().unwrap().to_string(), "2.0.3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionKey {
    parts: Vec<u64>,
}

impl VersionKey {
    /// Parse a version string such as `1`, `1.1` or `2.0.3`.
    ///
    /// Rejects empty input, empty parts (`1..2`), signs and non-digits.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::invalid_version(raw));
        }
        let mut parts = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::invalid_version(raw));
            }
            let value: u64 = part.parse().map_err(|_| Error::invalid_version(raw))?;
            parts.push(value);
        }
        // Canonical form: `1.0` is the same key as `1`. One part always stays.
        while parts.len() > 1 && *parts.last().unwrap() == 0 {
            parts.pop();
        }
        Ok(VersionKey { parts })
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    /// Three-way comparison, equivalent to `Ord` but mirroring the classic
    /// comparator signature.
    pub fn compare(&self, other: &VersionKey) -> Ordering {
        self.cmp(other)
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.parts {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for VersionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionKey::parse(s)
    }
}

impl From<u64> for VersionKey {
    fn from(value: u64) -> Self {
        VersionKey { parts: vec![value] }
    }
}

/// The version up to which migrations are considered.
///
/// `Latest` places no upper bound, `Current` resolves to the highest
/// successfully applied version once the metadata store has been read, and
/// `Version` is a literal bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Latest,
    Current,
    Version(VersionKey),
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "latest" | "LATEST" => Ok(Target::Latest),
            "current" | "CURRENT" => Ok(Target::Current),
            other => VersionKey::parse(other).map(Target::Version),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Latest => write!(f, "latest"),
            Target::Current => write!(f, "current"),
            Target::Version(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse(s)
    }
}
