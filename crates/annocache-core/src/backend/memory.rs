//! In-memory backend
//!
//! A complete [`AnnotationBackend`] kept in process memory. Hosts use it as
//! the working set of a file-backed store; tests use its fault injection,
//! pause gates and call log to drive the cache through failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use super::{AnnotationBackend, BackendOperation};
use crate::models::{Annotation, LoadOptions};

/// One attempted backend call, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub operation: BackendOperation,
    /// Page url for `load`, annotation url for everything else
    pub target: String,
}

#[derive(Debug, Default)]
struct Faults {
    /// One-shot failures, consumed by the next call of that operation
    next: Vec<BackendOperation>,
    /// Annotation urls whose mutations always fail
    urls: HashSet<String>,
}

/// Backend storing pages of annotations in memory
#[derive(Debug)]
pub struct MemoryBackend {
    pages: Mutex<HashMap<String, Vec<Annotation>>>,
    calls: Mutex<Vec<BackendCall>>,
    faults: Mutex<Faults>,
    paused: watch::Sender<HashSet<BackendOperation>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::with_pages(HashMap::new())
    }

    /// Create a backend holding the given pages
    pub fn with_pages(pages: HashMap<String, Vec<Annotation>>) -> Self {
        let (paused, _) = watch::channel(HashSet::new());
        Self {
            pages: Mutex::new(pages),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            paused,
        }
    }

    /// Store annotations directly, bypassing the call log and faults
    pub fn seed(&self, annotations: impl IntoIterator<Item = Annotation>) {
        let mut pages = lock(&self.pages);
        for annotation in annotations {
            pages
                .entry(annotation.page_url.clone())
                .or_default()
                .push(annotation);
        }
    }

    /// Copy of every stored page
    pub fn pages(&self) -> HashMap<String, Vec<Annotation>> {
        lock(&self.pages).clone()
    }

    /// Replace every stored page, bypassing the call log and faults
    pub fn replace_pages(&self, pages: HashMap<String, Vec<Annotation>>) {
        *lock(&self.pages) = pages;
    }

    /// Look up a stored annotation by url
    pub fn stored(&self, url: &str) -> Option<Annotation> {
        lock(&self.pages)
            .values()
            .flatten()
            .find(|a| a.url == url)
            .cloned()
    }

    /// Every call attempted so far
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Attempted calls of one operation
    pub fn calls_of(&self, operation: BackendOperation) -> Vec<BackendCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Make the next call of `operation` fail
    pub fn fail_next(&self, operation: BackendOperation) {
        lock(&self.faults).next.push(operation);
    }

    /// Make every mutation of the annotation with this url fail
    pub fn fail_url(&self, url: impl Into<String>) {
        lock(&self.faults).urls.insert(url.into());
    }

    /// Clear all injected failures
    pub fn clear_faults(&self) {
        let mut faults = lock(&self.faults);
        faults.next.clear();
        faults.urls.clear();
    }

    /// Hold calls of `operation` until [`resume`](Self::resume) is called
    pub fn pause(&self, operation: BackendOperation) {
        self.paused.send_modify(|paused| {
            paused.insert(operation);
        });
    }

    /// Release held calls of `operation`
    pub fn resume(&self, operation: BackendOperation) {
        self.paused.send_modify(|paused| {
            paused.remove(&operation);
        });
    }

    /// Record the call, wait while paused, then apply injected faults
    async fn enter(&self, operation: BackendOperation, target: &str) -> Result<()> {
        lock(&self.calls).push(BackendCall {
            operation,
            target: target.to_string(),
        });

        let mut paused = self.paused.subscribe();
        loop {
            let held = paused.borrow_and_update().contains(&operation);
            if !held {
                break;
            }
            if paused.changed().await.is_err() {
                break;
            }
        }

        let mut faults = lock(&self.faults);
        if operation != BackendOperation::Load && faults.urls.contains(target) {
            bail!("injected {} failure for {}", operation, target);
        }
        if let Some(pos) = faults.next.iter().position(|op| *op == operation) {
            faults.next.remove(pos);
            bail!("injected {} failure", operation);
        }
        Ok(())
    }
}

#[async_trait]
impl AnnotationBackend for MemoryBackend {
    async fn load(&self, page_url: &str, options: LoadOptions) -> Result<Vec<Annotation>> {
        self.enter(BackendOperation::Load, page_url).await?;

        let pages = lock(&self.pages);
        let annotations = pages
            .get(page_url)
            .map(|page| options.apply(page))
            .unwrap_or_default();
        debug!(page_url, count = annotations.len(), "Memory backend load");
        Ok(annotations)
    }

    async fn create(&self, annotation: &Annotation) -> Result<()> {
        self.enter(BackendOperation::Create, &annotation.url).await?;

        let mut pages = lock(&self.pages);
        if pages.values().flatten().any(|a| a.url == annotation.url) {
            bail!("annotation already exists: {}", annotation.url);
        }

        let mut stored = annotation.clone();
        stored.created_when.get_or_insert_with(Utc::now);
        pages
            .entry(stored.page_url.clone())
            .or_default()
            .push(stored);
        Ok(())
    }

    async fn update(&self, annotation: &Annotation) -> Result<()> {
        self.enter(BackendOperation::Update, &annotation.url).await?;

        let mut pages = lock(&self.pages);
        let stored = find_mut(&mut pages, &annotation.url)?;
        stored.comment = annotation.comment.clone();
        stored.has_bookmark = annotation.has_bookmark;
        stored.last_edited = Some(Utc::now());
        Ok(())
    }

    async fn update_tags(&self, annotation_url: &str, tags: &[String]) -> Result<()> {
        self.enter(BackendOperation::UpdateTags, annotation_url).await?;

        let mut pages = lock(&self.pages);
        let stored = find_mut(&mut pages, annotation_url)?;
        stored.tags = tags.to_vec();
        Ok(())
    }

    async fn delete(&self, annotation: &Annotation) -> Result<()> {
        self.enter(BackendOperation::Delete, &annotation.url).await?;

        let mut pages = lock(&self.pages);
        for page in pages.values_mut() {
            page.retain(|a| a.url != annotation.url);
        }
        pages.retain(|_, page| !page.is_empty());
        Ok(())
    }
}

fn find_mut<'a>(
    pages: &'a mut HashMap<String, Vec<Annotation>>,
    url: &str,
) -> Result<&'a mut Annotation> {
    pages
        .values_mut()
        .flatten()
        .find(|a| a.url == url)
        .ok_or_else(|| anyhow!("annotation not found: {}", url))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(id: &str, page: &str) -> Annotation {
        Annotation::with_url(format!("{}#{}", page, id), page, format!("comment {}", id))
    }

    #[tokio::test]
    async fn test_load_applies_window() {
        let backend = MemoryBackend::new();
        backend.seed((1..=5).map(|i| annotation(&i.to_string(), "p1")));

        let all = backend.load("p1", LoadOptions::all()).await.unwrap();
        assert_eq!(all.len(), 5);

        let window = backend
            .load("p1", LoadOptions::all().skip(1).limit(2))
            .await
            .unwrap();
        let ids: Vec<_> = window.iter().map(|a| a.fragment().to_string()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        assert!(backend.load("missing", LoadOptions::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_assigns_timestamp() {
        let backend = MemoryBackend::new();
        let a = annotation("a", "p1");
        backend.create(&a).await.unwrap();

        let stored = backend.stored(&a.url).unwrap();
        assert!(stored.created_when.is_some());
        assert!(backend.create(&a).await.is_err());
    }

    #[tokio::test]
    async fn test_update_touches_core_fields_only() {
        let backend = MemoryBackend::new();
        let mut a = annotation("a", "p1");
        a.add_tag("old");
        backend.seed([a.clone()]);

        a.set_comment("edited");
        a.set_tags(vec!["new".to_string()]);
        backend.update(&a).await.unwrap();

        let stored = backend.stored(&a.url).unwrap();
        assert_eq!(stored.comment, "edited");
        assert_eq!(stored.tags, vec!["old"]);
        assert!(stored.last_edited.is_some());

        backend.update_tags(&a.url, &a.tags).await.unwrap();
        assert_eq!(backend.stored(&a.url).unwrap().tags, vec!["new"]);
    }

    #[tokio::test]
    async fn test_update_unknown_fails() {
        let backend = MemoryBackend::new();
        let a = annotation("a", "p1");
        assert!(backend.update(&a).await.is_err());
        assert!(backend.update_tags(&a.url, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        let a = annotation("a", "p1");
        backend.seed([a.clone()]);

        backend.delete(&a).await.unwrap();
        backend.delete(&a).await.unwrap();
        assert!(backend.stored(&a.url).is_none());
        assert!(backend.pages().is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next(BackendOperation::Load);

        assert!(backend.load("p1", LoadOptions::all()).await.is_err());
        assert!(backend.load("p1", LoadOptions::all()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_url_hits_every_mutation() {
        let backend = MemoryBackend::new();
        let a = annotation("a", "p1");
        backend.fail_url(a.url.clone());

        assert!(backend.create(&a).await.is_err());
        assert!(backend.delete(&a).await.is_err());
        assert!(backend.load("p1", LoadOptions::all()).await.is_ok());

        backend.clear_faults();
        assert!(backend.create(&a).await.is_ok());
    }

    #[tokio::test]
    async fn test_call_log_records_attempts() {
        let backend = MemoryBackend::new();
        let a = annotation("a", "p1");
        backend.fail_next(BackendOperation::Create);

        let _ = backend.create(&a).await;
        let _ = backend.load("p1", LoadOptions::all()).await;

        assert_eq!(
            backend.calls(),
            vec![
                BackendCall {
                    operation: BackendOperation::Create,
                    target: a.url.clone(),
                },
                BackendCall {
                    operation: BackendOperation::Load,
                    target: "p1".to_string(),
                },
            ]
        );
        assert_eq!(backend.calls_of(BackendOperation::Create).len(), 1);
    }

    #[tokio::test]
    async fn test_pause_holds_until_resume() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        backend.pause(BackendOperation::Create);

        let a = annotation("a", "p1");
        let task = {
            let backend = backend.clone();
            let a = a.clone();
            tokio::spawn(async move { backend.create(&a).await })
        };

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        assert!(backend.stored(&a.url).is_none());

        backend.resume(BackendOperation::Create);
        task.await.unwrap().unwrap();
        assert!(backend.stored(&a.url).is_some());
    }
}
