//! Content projections
//!
//! Records of different kinds carry their user-facing content in different
//! shapes. Each known shape has one narrow adapter that turns a record into a
//! typed projection; callers match on [`ContentProjection`] instead of probing
//! fields.

use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;
use crate::record::{Kind, Record, RecordId};

/// Long-form article (kind 30023)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleContent {
    pub title: String,
    pub summary: Option<String>,
    pub image: Option<String>,
    pub published_at: Option<u64>,
    pub markdown: String,
    pub topics: Vec<String>,
}

impl ArticleContent {
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.kind != Kind::LONG_FORM {
            return None;
        }
        let title = record
            .tag_value("title")
            .or_else(|| record.identifier())
            .unwrap_or_default()
            .to_string();
        Some(Self {
            title,
            summary: record.tag_value("summary").map(str::to_string),
            image: record.tag_value("image").map(str::to_string),
            published_at: record
                .tag_value("published_at")
                .and_then(|v| v.parse().ok()),
            markdown: record.content.clone(),
            topics: record.tag_values("t").map(str::to_string).collect(),
        })
    }
}

/// Reference from a highlight back to its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HighlightSource {
    /// An addressable record, usually an article
    Coordinate(String),
    /// An immutable record
    Record(RecordId),
    /// An external web page
    Url(String),
}

/// Highlight (kind 9802)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightContent {
    pub text: String,
    pub context: Option<String>,
    pub comment: Option<String>,
    pub source: Option<HighlightSource>,
}

impl HighlightContent {
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.kind != Kind::HIGHLIGHT {
            return None;
        }
        let source = record
            .tag_value("a")
            .map(|a| HighlightSource::Coordinate(a.to_string()))
            .or_else(|| {
                record
                    .tag_value("e")
                    .map(|e| HighlightSource::Record(RecordId::new(e)))
            })
            .or_else(|| record.tag_value("r").map(|r| HighlightSource::Url(r.to_string())));
        Some(Self {
            text: record.content.clone(),
            context: record.tag_value("context").map(str::to_string),
            comment: record.tag_value("comment").map(str::to_string),
            source,
        })
    }
}

/// Reader settings stored as app data (kind 30078)
///
/// The body is an opaque JSON object owned by the settings surface; only
/// well-formed JSON objects are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderSettings {
    pub namespace: String,
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl ReaderSettings {
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.kind != Kind::APP_DATA {
            return None;
        }
        let values = match serde_json::from_str::<serde_json::Value>(&record.content) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return None,
        };
        Some(Self {
            namespace: record.identifier().unwrap_or_default().to_string(),
            values,
        })
    }
}

/// Bookmark list (kinds 10003 and 30003)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkList {
    pub name: Option<String>,
    pub records: Vec<RecordId>,
    pub coordinates: Vec<String>,
    pub urls: Vec<String>,
}

impl BookmarkList {
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.kind != Kind::BOOKMARKS && record.kind != Kind::BOOKMARK_SET {
            return None;
        }
        Some(Self {
            name: record
                .tag_value("title")
                .or_else(|| record.identifier())
                .map(str::to_string),
            records: record.tag_values("e").map(RecordId::new).collect(),
            coordinates: record.tag_values("a").map(str::to_string).collect(),
            urls: record.tag_values("r").map(str::to_string).collect(),
        })
    }
}

/// Typed projection of a record's user-facing content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentProjection {
    Article(ArticleContent),
    Highlight(HighlightContent),
    Settings(ReaderSettings),
    Bookmarks(BookmarkList),
}

impl ContentProjection {
    /// Whether coordinates of this kind resolve to a projection
    ///
    /// Highlights are regular records and are fetched by filter, never by
    /// coordinate.
    pub fn supports(kind: Kind) -> bool {
        matches!(
            kind,
            Kind::LONG_FORM | Kind::APP_DATA | Kind::BOOKMARKS | Kind::BOOKMARK_SET
        )
    }

    /// Dispatch to the adapter for the record's kind
    pub fn from_record(record: &Record) -> Option<Self> {
        match record.kind {
            Kind::LONG_FORM => ArticleContent::from_record(record).map(Self::Article),
            Kind::HIGHLIGHT => HighlightContent::from_record(record).map(Self::Highlight),
            Kind::APP_DATA => ReaderSettings::from_record(record).map(Self::Settings),
            Kind::BOOKMARKS | Kind::BOOKMARK_SET => {
                BookmarkList::from_record(record).map(Self::Bookmarks)
            }
            _ => None,
        }
    }
}

/// A resolved piece of content together with the record it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContent {
    pub coordinate: Coordinate,
    pub record_id: RecordId,
    pub created_at: u64,
    pub projection: ContentProjection,
}

impl ResolvedContent {
    /// Project a replaceable record; `None` for unknown kinds
    pub fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            coordinate: record.coordinate()?,
            record_id: record.id.clone(),
            created_at: record.created_at,
            projection: ContentProjection::from_record(record)?,
        })
    }

    /// Whether this content is strictly newer than `other`
    pub fn is_newer_than(&self, other: &ResolvedContent) -> bool {
        self.created_at > other.created_at
            || (self.created_at == other.created_at && self.record_id < other.record_id)
    }
}
