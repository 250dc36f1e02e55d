//! Annotation command handlers
//!
//! Every command loads the page into the cache first; writes then go
//! through the cache and are awaited until the backend has accepted or
//! rejected them.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use annocache_core::{Annotation, AnnotationsCache, LoadOptions, PendingMutation};

use crate::output::Output;

/// Fields an edit may change; `None` keeps the current value
#[derive(Debug, Default)]
pub struct Changes {
    pub comment: Option<String>,
    pub tags: Option<Vec<String>>,
    pub bookmark: Option<bool>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.comment.is_none() && self.tags.is_none() && self.bookmark.is_none()
    }
}

/// List the annotations of a page
pub async fn list(
    cache: &AnnotationsCache,
    page: &str,
    options: LoadOptions,
    output: &Output,
) -> Result<()> {
    let annotations = load_page(cache, page, options).await?;
    output.print_annotations(&annotations);
    Ok(())
}

/// Create a new annotation on a page
pub async fn add(
    cache: &AnnotationsCache,
    page: &str,
    comment: String,
    body: Option<String>,
    tags: Vec<String>,
    bookmark: bool,
    output: &Output,
) -> Result<()> {
    load_page(cache, page, LoadOptions::all()).await?;

    let mut annotation = Annotation::new(page, comment);
    annotation.set_body(body);
    annotation.set_bookmark(bookmark);
    annotation.set_tags(tags);

    confirm(cache.create(annotation.clone())).await?;

    output.success(&format!("Created annotation: {}", annotation.fragment()));
    output.print_annotation(&annotation);
    Ok(())
}

/// Edit an existing annotation
pub async fn edit(
    cache: &AnnotationsCache,
    page: &str,
    id: &str,
    changes: Changes,
    output: &Output,
) -> Result<()> {
    if changes.is_empty() {
        bail!("Nothing to change. Pass --comment, --tag or --bookmark/--no-bookmark.");
    }

    let annotations = load_page(cache, page, LoadOptions::all()).await?;
    let mut annotation = resolve(&annotations, id)?.clone();

    if let Some(comment) = changes.comment {
        annotation.set_comment(comment);
    }
    if let Some(tags) = changes.tags {
        annotation.set_tags(tags);
    }
    if let Some(bookmark) = changes.bookmark {
        annotation.set_bookmark(bookmark);
    }

    confirm(cache.update(annotation.clone())).await?;

    output.success("Annotation updated");
    output.print_annotation(&annotation);
    Ok(())
}

/// Delete an annotation
pub async fn delete(cache: &AnnotationsCache, page: &str, id: &str, output: &Output) -> Result<()> {
    let annotations = load_page(cache, page, LoadOptions::all()).await?;
    let annotation = resolve(&annotations, id)?.clone();

    confirm(cache.delete(annotation.clone())).await?;

    output.success(&format!("Deleted annotation: {}", annotation.fragment()));
    Ok(())
}

/// List the tags used on a page with usage counts
pub async fn tags(cache: &AnnotationsCache, page: &str, output: &Output) -> Result<()> {
    let annotations = load_page(cache, page, LoadOptions::all()).await?;
    output.print_tags(&count_tags(&annotations));
    Ok(())
}

async fn load_page(
    cache: &AnnotationsCache,
    page: &str,
    options: LoadOptions,
) -> Result<Vec<Annotation>> {
    let snapshot = cache
        .load(page, options)
        .await
        .with_context(|| format!("Failed to load annotations for {}", page))?;
    Ok(snapshot.to_vec())
}

async fn confirm(pending: PendingMutation) -> Result<()> {
    let kind = pending.kind();
    pending
        .wait()
        .await
        .with_context(|| format!("Failed to save {}; the change was rolled back", kind))
}

/// Find an annotation by full URL or by a unique prefix of its fragment
fn resolve<'a>(annotations: &'a [Annotation], id: &str) -> Result<&'a Annotation> {
    if let Some(exact) = annotations.iter().find(|a| a.url == id) {
        return Ok(exact);
    }

    let matches: Vec<_> = annotations
        .iter()
        .filter(|a| a.fragment().starts_with(id))
        .collect();

    match matches.len() {
        0 => bail!("No annotation found matching: {}", id),
        1 => Ok(matches[0]),
        _ => {
            eprintln!("Multiple annotations match '{}':", id);
            for annotation in &matches {
                eprintln!("  {} - {}", annotation.fragment(), annotation.comment);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}

/// Tag usage counts, most used first
fn count_tags(annotations: &[Annotation]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for tag in annotations.iter().flat_map(|a| a.tags.iter()) {
        *counts.entry(tag.as_str()).or_default() += 1;
    }

    let mut tags: Vec<_> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    tags
}
