//! Backend adapter contract
//!
//! The cache only ever talks to persistence through [`AnnotationBackend`].
//! The host supplies an implementation; the cache calls out, never the
//! reverse.
//!
//! ## Operations
//!
//! - `load`: ordered annotations for a page, full replace semantics
//! - `create`: persist a new annotation (backend assigns `created_when` if absent)
//! - `update`: core fields only
//! - `update_tags`: tags are propagated through a separate call
//! - `delete`: remove by url

mod memory;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Annotation, LoadOptions};

pub use memory::{BackendCall, MemoryBackend};

/// Names a backend operation in errors, logs and call logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendOperation {
    Load,
    Create,
    Update,
    UpdateTags,
    Delete,
}

impl BackendOperation {
    /// Wire name of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendOperation::Load => "load",
            BackendOperation::Create => "create",
            BackendOperation::Update => "update",
            BackendOperation::UpdateTags => "updateTags",
            BackendOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for BackendOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence operations the cache reconciles against
///
/// Consumers inject an `Arc<dyn AnnotationBackend>`. Errors are plain
/// `anyhow` errors; the cache wraps them with the failing operation.
#[async_trait]
pub trait AnnotationBackend: Send + Sync {
    /// Load the annotations of a page, in display order
    async fn load(&self, page_url: &str, options: LoadOptions) -> Result<Vec<Annotation>>;

    /// Persist a new annotation
    async fn create(&self, annotation: &Annotation) -> Result<()>;

    /// Persist changes to an annotation's core fields
    async fn update(&self, annotation: &Annotation) -> Result<()>;

    /// Replace the tags stored for an annotation
    async fn update_tags(&self, annotation_url: &str, tags: &[String]) -> Result<()>;

    /// Remove an annotation
    async fn delete(&self, annotation: &Annotation) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_display() {
        assert_eq!(BackendOperation::Load.to_string(), "load");
        assert_eq!(BackendOperation::UpdateTags.to_string(), "updateTags");
    }

    #[test]
    fn test_operation_serialization() {
        let json = serde_json::to_string(&BackendOperation::UpdateTags).unwrap();
        assert_eq!(json, "\"updateTags\"");
    }
}
