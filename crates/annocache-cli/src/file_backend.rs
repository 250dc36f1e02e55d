//! JSON file backend
//!
//! Keeps every page in a [`MemoryBackend`] and writes the whole set back to
//! `annotations.json` after each accepted mutation. Writes go to a temp
//! file first and are renamed into place, so the file is never left
//! half-written. A mutation whose write fails is undone in memory as well,
//! so a rejected mutation leaves no trace.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use annocache_core::{Annotation, AnnotationBackend, LoadOptions, MemoryBackend};

/// Annotation backend persisted to a single JSON file
pub struct FileBackend {
    path: PathBuf,
    pages: MemoryBackend,
    /// Held from a mutation until its write finishes
    writes: Mutex<()>,
}

impl FileBackend {
    /// Open the file, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let pages: HashMap<String, Vec<Annotation>> = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read annotations file {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse annotations file {:?}", path))?
        } else {
            HashMap::new()
        };

        debug!(path = ?path, pages = pages.len(), "Opened annotations file");
        Ok(Self {
            path,
            pages: MemoryBackend::with_pages(pages),
            writes: Mutex::new(()),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current pages, restoring `before` in memory if that fails
    fn commit(&self, before: HashMap<String, Vec<Annotation>>) -> Result<()> {
        self.persist().map_err(|e| {
            warn!(path = ?self.path, "Write failed, undoing mutation: {:#}", e);
            self.pages.replace_pages(before);
            e
        })
    }

    fn persist(&self) -> Result<()> {
        let pages: BTreeMap<_, _> = self.pages.pages().into_iter().collect();
        let json = serde_json::to_vec_pretty(&pages).context("Failed to serialize annotations")?;
        atomic_write(&self.path, &json)
            .with_context(|| format!("Failed to save annotations to {:?}", self.path))
    }
}

#[async_trait]
impl AnnotationBackend for FileBackend {
    async fn load(&self, page_url: &str, options: LoadOptions) -> Result<Vec<Annotation>> {
        self.pages.load(page_url, options).await
    }

    async fn create(&self, annotation: &Annotation) -> Result<()> {
        let _write = self.writes.lock().await;
        let before = self.pages.pages();
        self.pages.create(annotation).await?;
        self.commit(before)
    }

    async fn update(&self, annotation: &Annotation) -> Result<()> {
        let _write = self.writes.lock().await;
        let before = self.pages.pages();
        self.pages.update(annotation).await?;
        self.commit(before)
    }

    async fn update_tags(&self, annotation_url: &str, tags: &[String]) -> Result<()> {
        let _write = self.writes.lock().await;
        let before = self.pages.pages();
        self.pages.update_tags(annotation_url, tags).await?;
        self.commit(before)
    }

    async fn delete(&self, annotation: &Annotation) -> Result<()> {
        let _write = self.writes.lock().await;
        let before = self.pages.pages();
        self.pages.delete(annotation).await?;
        self.commit(before)
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

    file.write_all(data)
        .with_context(|| format!("Failed to write to temp file {:?}", temp_path))?;

    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}
