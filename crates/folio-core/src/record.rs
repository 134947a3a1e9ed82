//! Immutable signed records
//!
//! A [`Record`] is the unit exchanged with network nodes. Records are never
//! mutated in place; "editing" a replaceable record means publishing a newer
//! record with the same [`Coordinate`] and letting the greatest timestamp win.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;
use crate::error::ReferenceError;

/// Content identifier of a record (lowercase hex digest)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wrap an id received from a trusted source without validation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse a 64-character hex id
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let s = s.trim();
        if s.len() != 64 || hex::decode(s).is_err() {
            return Err(ReferenceError::InvalidRecordId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Author identity (public key) of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorKey(String);

impl AuthorKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Integer kind tag of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    pub const METADATA: Kind = Kind(0);
    pub const CONTACTS: Kind = Kind(3);
    pub const HIGHLIGHT: Kind = Kind(9802);
    pub const BOOKMARKS: Kind = Kind(10003);
    pub const BOOKMARK_SET: Kind = Kind(30003);
    pub const LONG_FORM: Kind = Kind(30023);
    pub const APP_DATA: Kind = Kind(30078);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Replaceable kinds keep only the newest record per coordinate
    pub fn is_replaceable(self) -> bool {
        self.0 == 0 || self.0 == 3 || (10_000..20_000).contains(&self.0) || self.is_addressable()
    }

    /// Addressable kinds are replaceable per `d` tag identifier
    pub fn is_addressable(self) -> bool {
        (30_000..40_000).contains(&self.0)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered list of strings, the first being the tag name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Two-element tag `[name, value]`
    pub fn pair(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self(vec![name.into(), value.into()])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// A draft record awaiting signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedRecord {
    pub author: AuthorKey,
    pub kind: Kind,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedRecord {
    pub fn new(author: AuthorKey, kind: Kind, created_at: u64) -> Self {
        Self {
            author,
            kind,
            created_at,
            tags: Vec::new(),
            content: String::new(),
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Content-derived id over the canonical serialization
    pub fn compute_id(&self) -> RecordId {
        let canonical = serde_json::json!([
            0,
            self.author.as_str(),
            self.created_at,
            self.kind.as_u16(),
            self.tags,
            self.content,
        ]);
        let digest = blake3::hash(canonical.to_string().as_bytes());
        RecordId(hex::encode(digest.as_bytes()))
    }

    /// Attach an id and signature produced by a signer
    pub fn into_record(self, id: RecordId, sig: impl Into<String>) -> Record {
        Record {
            id,
            author: self.author,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
        }
    }
}

/// An immutable, content-identified, signed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(rename = "pubkey")]
    pub author: AuthorKey,
    pub kind: Kind,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Record {
    /// First value of the first tag with the given name
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All values for tags with the given name
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// The `d` tag identifier of an addressable record
    pub fn identifier(&self) -> Option<&str> {
        self.tag_value("d")
    }

    /// Logical coordinate, for replaceable kinds only
    pub fn coordinate(&self) -> Option<Coordinate> {
        if !self.kind.is_replaceable() {
            return None;
        }
        let identifier = if self.kind.is_addressable() {
            self.identifier().unwrap_or_default().to_string()
        } else {
            String::new()
        };
        Some(Coordinate::new(self.kind, self.author.clone(), identifier))
    }

    /// Whether `self` should replace `other` under latest-timestamp-wins
    ///
    /// Ties are broken by the lexically lower id so every replica picks the
    /// same winner.
    pub fn supersedes(&self, other: &Record) -> bool {
        match self.created_at.cmp(&other.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.id < other.id,
        }
    }
}

/// Pick the newest record by timestamp
pub fn newest<'a>(records: impl IntoIterator<Item = &'a Record>) -> Option<&'a Record> {
    records.into_iter().fold(None, |best, r| match best {
        Some(b) if !r.supersedes(b) => Some(b),
        _ => Some(r),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: u16, created_at: u64) -> UnsignedRecord {
        UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind(kind), created_at)
    }

    #[test]
    fn test_record_id_parse() {
        let hex_id = "ab".repeat(32);
        assert!(RecordId::parse(&hex_id).is_ok());
        assert!(RecordId::parse("abc").is_err());
        assert!(RecordId::parse(&"zz".repeat(32)).is_err());
        assert_eq!(RecordId::parse(&hex_id.to_uppercase()).unwrap().as_str(), hex_id);
    }

    #[test]
    fn test_kind_classification() {
        assert!(Kind::METADATA.is_replaceable());
        assert!(Kind::BOOKMARKS.is_replaceable());
        assert!(!Kind::BOOKMARKS.is_addressable());
        assert!(Kind::LONG_FORM.is_addressable());
        assert!(!Kind::HIGHLIGHT.is_replaceable());
        assert!(!Kind(1).is_replaceable());
    }

    #[test]
    fn test_compute_id_is_deterministic() {
        let a = draft(30023, 100).with_content("hello");
        let b = draft(30023, 100).with_content("hello");
        let c = draft(30023, 101).with_content("hello");
        assert_eq!(a.compute_id(), b.compute_id());
        assert_ne!(a.compute_id(), c.compute_id());
        assert_eq!(a.compute_id().as_str().len(), 64);
    }

    #[test]
    fn test_coordinate_derivation() {
        let unsigned = draft(30023, 10).with_tag(Tag::pair("d", "my-article"));
        let id = unsigned.compute_id();
        let record = unsigned.into_record(id, "sig");
        let coord = record.coordinate().unwrap();
        assert_eq!(coord.to_string(), "30023:pubkeyA:my-article");

        let unsigned = draft(9802, 10);
        let id = unsigned.compute_id();
        let highlight = unsigned.into_record(id, "sig");
        assert!(highlight.coordinate().is_none());
    }

    #[test]
    fn test_newest_and_tiebreak() {
        let older = {
            let u = draft(30023, 10);
            let id = u.compute_id();
            u.into_record(id, "s")
        };
        let newer = {
            let u = draft(30023, 20);
            let id = u.compute_id();
            u.into_record(id, "s")
        };
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert_eq!(newest([&older, &newer]).unwrap().id, newer.id);
        assert_eq!(newest([&newer, &older]).unwrap().id, newer.id);
        assert!(newest(Vec::<&Record>::new()).is_none());
    }

    #[test]
    fn test_record_serializes_with_pubkey_field() {
        let u = draft(1, 5).with_tag(Tag::pair("t", "rust"));
        let id = u.compute_id();
        let record = u.into_record(id, "sig");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["pubkey"], "pubkeyA");
        assert_eq!(json["tags"][0][1], "rust");
    }
}
