//! Logical coordinates of replaceable records

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReferenceError;
use crate::record::{AuthorKey, Kind};

/// `(kind, author, identifier)` key addressing the current version of a
/// replaceable record, independent of its record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate {
    pub kind: Kind,
    pub author: AuthorKey,
    pub identifier: String,
}

impl Coordinate {
    pub fn new(kind: Kind, author: AuthorKey, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            author,
            identifier: identifier.into(),
        }
    }

    /// Parse `kind:author:identifier`
    ///
    /// The identifier may itself contain `:`; only the first two separators
    /// are significant. Addressable kinds require a non-empty identifier.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let invalid = || ReferenceError::InvalidCoordinate(s.to_string());

        let mut parts = s.splitn(3, ':');
        let kind = parts
            .next()
            .and_then(|k| k.parse::<u16>().ok())
            .map(Kind)
            .ok_or_else(invalid)?;
        let author = parts
            .next()
            .filter(|a| !a.is_empty() && !a.chars().any(char::is_whitespace))
            .ok_or_else(invalid)?;
        let identifier = parts.next().ok_or_else(invalid)?;

        if !kind.is_replaceable() {
            return Err(invalid());
        }
        if kind.is_addressable() && identifier.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(kind, AuthorKey::new(author), identifier))
    }

    /// Key used by string-addressed stores (cache, persisted state)
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.author, self.identifier)
    }
}

impl FromStr for Coordinate {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let coord: Coordinate = "30023:pubkeyA:my-article".parse().unwrap();
        assert_eq!(coord.kind, Kind::LONG_FORM);
        assert_eq!(coord.author.as_str(), "pubkeyA");
        assert_eq!(coord.identifier, "my-article");
        assert_eq!(coord.to_string(), "30023:pubkeyA:my-article");
    }

    #[test]
    fn test_identifier_may_contain_separator() {
        let coord = Coordinate::parse("30078:pubkeyA:folio:settings").unwrap();
        assert_eq!(coord.identifier, "folio:settings");
    }

    #[test]
    fn test_non_addressable_allows_empty_identifier() {
        let coord = Coordinate::parse("10003:pubkeyA:").unwrap();
        assert_eq!(coord.kind, Kind::BOOKMARKS);
        assert!(coord.identifier.is_empty());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Coordinate::parse("").is_err());
        assert!(Coordinate::parse("abc:pubkeyA:x").is_err());
        assert!(Coordinate::parse("30023::x").is_err());
        assert!(Coordinate::parse("30023:pubkeyA").is_err());
        assert!(Coordinate::parse("30023:pubkeyA:").is_err());
        // Regular kinds have no coordinate
        assert!(Coordinate::parse("1:pubkeyA:x").is_err());
    }
}
