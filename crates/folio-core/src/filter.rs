//! Query filters sent to node tiers and the local store

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;
use crate::error::ReferenceError;
use crate::record::{AuthorKey, Kind, Record, RecordId};

/// A set of constraints matched against records
///
/// Empty constraint sets mean "any". Tag constraints are keyed by
/// single-letter tag name and match if the record carries the tag with any
/// of the listed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ids: BTreeSet<RecordId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub kinds: BTreeSet<Kind>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub authors: BTreeSet<AuthorKey>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<char, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter addressing the current version of a replaceable record
    pub fn for_coordinate(coord: &Coordinate) -> Self {
        let mut filter = Self::new().kind(coord.kind).author(coord.author.clone());
        if coord.kind.is_addressable() {
            filter = filter.tag('d', coord.identifier.clone());
        }
        filter
    }

    /// Filter addressing specific immutable records
    pub fn for_ids(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: RecordId) -> Self {
        self.ids.insert(id);
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn author(mut self, author: AuthorKey) -> Self {
        self.authors.insert(author);
        self
    }

    pub fn tag(mut self, name: char, value: impl Into<String>) -> Self {
        self.tags.entry(name).or_default().insert(value.into());
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if the filter only constrains record ids
    pub fn is_id_lookup(&self) -> bool {
        !self.ids.is_empty()
            && self.kinds.is_empty()
            && self.authors.is_empty()
            && self.tags.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
            && self.kinds.is_empty()
            && self.authors.is_empty()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
    }

    /// Reject filters that would match everything or nothing by construction
    pub fn validate(&self) -> Result<(), ReferenceError> {
        if self.is_empty() {
            return Err(ReferenceError::InvalidFilter(
                "filter has no constraints".to_string(),
            ));
        }
        if self.limit == Some(0) {
            return Err(ReferenceError::InvalidFilter("limit is zero".to_string()));
        }
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(ReferenceError::InvalidFilter(format!(
                "since {} is after until {}",
                since, until
            )));
        }
        Ok(())
    }

    /// Whether a record satisfies every constraint
    pub fn matches(&self, record: &Record) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&record.id) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&record.author) {
            return false;
        }
        if self.since.is_some_and(|since| record.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            let mut buf = [0u8; 4];
            let name = name.encode_utf8(&mut buf);
            record.tag_values(name).any(|v| values.contains(v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Tag, UnsignedRecord};

    fn article(ident: &str, created_at: u64) -> Record {
        let u = UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::LONG_FORM, created_at)
            .with_tag(Tag::pair("d", ident))
            .with_tag(Tag::pair("t", "rust"));
        let id = u.compute_id();
        u.into_record(id, "sig")
    }

    #[test]
    fn test_coordinate_filter_matches() {
        let coord = Coordinate::parse("30023:pubkeyA:my-article").unwrap();
        let filter = QueryFilter::for_coordinate(&coord);
        assert!(filter.matches(&article("my-article", 1)));
        assert!(!filter.matches(&article("other", 1)));
    }

    #[test]
    fn test_id_lookup_detection() {
        let rec = article("a", 1);
        let filter = QueryFilter::for_ids([rec.id.clone()]);
        assert!(filter.is_id_lookup());
        assert!(filter.matches(&rec));
        assert!(!QueryFilter::new().kind(Kind::HIGHLIGHT).is_id_lookup());
    }

    #[test]
    fn test_time_bounds() {
        let rec = article("a", 100);
        assert!(QueryFilter::new().since(100).matches(&rec));
        assert!(!QueryFilter::new().since(101).matches(&rec));
        assert!(!QueryFilter::new().until(99).matches(&rec));
    }

    #[test]
    fn test_validate() {
        assert!(QueryFilter::new().validate().is_err());
        assert!(QueryFilter::new().kind(Kind::HIGHLIGHT).limit(0).validate().is_err());
        assert!(QueryFilter::new().since(10).until(5).validate().is_err());
        assert!(QueryFilter::new().kind(Kind::HIGHLIGHT).validate().is_ok());
    }

    #[test]
    fn test_tag_constraints() {
        let rec = article("a", 1);
        assert!(QueryFilter::new().tag('t', "rust").matches(&rec));
        assert!(!QueryFilter::new().tag('t', "go").matches(&rec));
        assert!(!QueryFilter::new().tag('e', "x").matches(&rec));
    }
}
