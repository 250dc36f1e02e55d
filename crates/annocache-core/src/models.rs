//! Data models for annocache
//!
//! Defines the annotation record held by the cache and the pagination
//! window passed through to the backend. Annotations serialize with
//! camelCase keys so they match the JSON the host already speaks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable version of the cached sequence
///
/// Every mutation produces a fresh vector behind a new `Arc`, so a
/// snapshot captured earlier never changes underneath its holder.
pub type Snapshot = Arc<Vec<Annotation>>;

/// A user-authored annotation on a page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    /// Unique identifier, also the key its tags are stored under
    pub url: String,
    /// The page (scope key) this annotation belongs to
    pub page_url: String,
    /// Free-text comment
    #[serde(default)]
    pub comment: String,
    /// Highlighted text the annotation is anchored to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// In-page anchor, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<serde_json::Value>,
    /// Tags for organization
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether the annotation is bookmarked
    #[serde(default)]
    pub has_bookmark: bool,
    /// When this annotation was created (assigned by the backend when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_when: Option<DateTime<Utc>>,
    /// When the backend last accepted an edit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edited: Option<DateTime<Utc>>,
    /// Embedded image as a base64 data URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_image: Option<String>,
}

impl Annotation {
    /// Create a new annotation on a page with a generated url
    pub fn new(page_url: impl Into<String>, comment: impl Into<String>) -> Self {
        let page_url = page_url.into();
        let url = format!("{}#{}", page_url, Uuid::new_v4().simple());
        Self::with_url(url, page_url, comment)
    }

    /// Create an annotation with a specific url (for loading from a backend)
    pub fn with_url(
        url: impl Into<String>,
        page_url: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            page_url: page_url.into(),
            comment: comment.into(),
            body: None,
            selector: None,
            tags: Vec::new(),
            has_bookmark: false,
            created_when: None,
            last_edited: None,
            embedded_image: None,
        }
    }

    /// The part of the url after `#`, or the whole url if there is none
    pub fn fragment(&self) -> &str {
        self.url
            .rsplit_once('#')
            .map(|(_, fragment)| fragment)
            .unwrap_or(&self.url)
    }

    /// Update the comment
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    /// Set the highlighted text
    pub fn set_body(&mut self, body: Option<String>) {
        self.body = body;
    }

    /// Set the bookmark flag
    pub fn set_bookmark(&mut self, bookmarked: bool) {
        self.has_bookmark = bookmarked;
    }

    /// Add a tag
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Remove a tag
    pub fn remove_tag(&mut self, tag: &str) {
        if let Some(pos) = self.tags.iter().position(|t| t == tag) {
            self.tags.remove(pos);
        }
    }

    /// Set all tags (replacing existing, dropping duplicates)
    pub fn set_tags(&mut self, tags: Vec<String>) {
        self.tags.clear();
        for tag in tags {
            self.add_tag(tag);
        }
    }
}

/// Pagination window for a backend load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Maximum number of annotations to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Number of annotations to skip from the start of the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

impl LoadOptions {
    /// Load everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Set the limit
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the skip offset
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Apply the window to an ordered slice
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        items.iter().skip(skip).take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_new() {
        let annotation = Annotation::new("https://example.com/page", "nice");
        assert!(annotation.url.starts_with("https://example.com/page#"));
        assert_eq!(annotation.page_url, "https://example.com/page");
        assert_eq!(annotation.comment, "nice");
        assert!(annotation.tags.is_empty());
        assert!(!annotation.has_bookmark);
        assert!(annotation.created_when.is_none());
    }

    #[test]
    fn test_annotation_urls_are_unique() {
        let a = Annotation::new("https://example.com", "");
        let b = Annotation::new("https://example.com", "");
        assert_ne!(a.url, b.url);
    }

    #[test]
    fn test_fragment() {
        let annotation = Annotation::with_url("https://example.com#abc123", "https://example.com", "");
        assert_eq!(annotation.fragment(), "abc123");

        let bare = Annotation::with_url("plain-id", "https://example.com", "");
        assert_eq!(bare.fragment(), "plain-id");
    }

    #[test]
    fn test_annotation_tags() {
        let mut annotation = Annotation::new("https://example.com", "");
        annotation.add_tag("rust");
        annotation.add_tag("async");
        assert_eq!(annotation.tags, vec!["rust", "async"]);

        // Adding duplicate should not add again
        annotation.add_tag("rust");
        assert_eq!(annotation.tags.len(), 2);

        annotation.remove_tag("rust");
        assert_eq!(annotation.tags, vec!["async"]);

        annotation.set_tags(vec!["a".to_string(), "b".to_string(), "a".to_string()]);
        assert_eq!(annotation.tags, vec!["a", "b"]);
    }

    #[test]
    fn test_serialization_uses_camel_case() {
        let mut annotation = Annotation::with_url("u1", "https://example.com", "hello");
        annotation.set_bookmark(true);
        let json = serde_json::to_value(&annotation).unwrap();
        assert_eq!(json["pageUrl"], "https://example.com");
        assert_eq!(json["hasBookmark"], true);
        assert!(json.get("createdWhen").is_none());

        let parsed: Annotation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, annotation);
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let parsed: Annotation =
            serde_json::from_str(r#"{"url": "u1", "pageUrl": "p1"}"#).unwrap();
        assert_eq!(parsed.url, "u1");
        assert!(parsed.comment.is_empty());
        assert!(parsed.tags.is_empty());
    }

    #[test]
    fn test_load_options_window() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(LoadOptions::all().apply(&items), items);
        assert_eq!(LoadOptions::all().skip(1).limit(2).apply(&items), vec![2, 3]);
        assert_eq!(LoadOptions::all().skip(10).apply(&items), Vec::<i32>::new());
        assert_eq!(LoadOptions::all().limit(0).apply(&items), Vec::<i32>::new());
    }
}
