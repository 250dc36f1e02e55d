//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use annocache_core::{Annotation, CacheEvent};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a single annotation
    pub fn print_annotation(&self, annotation: &Annotation) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:        {}", annotation.fragment());
                println!("URL:       {}", annotation.url);
                println!("Page:      {}", annotation.page_url);
                if let Some(ref body) = annotation.body {
                    println!("Highlight: {}", truncate_line(body, 60));
                }
                if !annotation.comment.is_empty() {
                    println!("Comment:   {}", annotation.comment);
                }
                if !annotation.tags.is_empty() {
                    println!("Tags:      {}", annotation.tags.join(", "));
                }
                println!(
                    "Bookmark:  {}",
                    if annotation.has_bookmark { "yes" } else { "no" }
                );
                if let Some(created) = annotation.created_when {
                    println!("Created:   {}", created.format("%Y-%m-%d %H:%M"));
                }
                if let Some(edited) = annotation.last_edited {
                    println!("Edited:    {}", edited.format("%Y-%m-%d %H:%M"));
                }
            }
            OutputFormat::Json => print_json(annotation),
            OutputFormat::Quiet => {
                println!("{}", annotation.url);
            }
        }
    }

    /// Print a list of annotations
    pub fn print_annotations(&self, annotations: &[Annotation]) {
        match self.format {
            OutputFormat::Human => {
                if annotations.is_empty() {
                    println!("No annotations found.");
                    return;
                }
                for annotation in annotations {
                    let bookmark = if annotation.has_bookmark { "*" } else { " " };
                    let tags = if annotation.tags.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", annotation.tags.join(", "))
                    };
                    println!(
                        "{} {} | {}{}",
                        bookmark,
                        truncate(annotation.fragment(), 8),
                        truncate_line(&annotation.comment, 50),
                        tags
                    );
                }
                println!("\n{} annotation(s)", annotations.len());
            }
            OutputFormat::Json => print_json(&annotations),
            OutputFormat::Quiet => {
                for annotation in annotations {
                    println!("{}", annotation.url);
                }
            }
        }
    }

    /// Print a list of tags
    pub fn print_tags(&self, tags: &[(String, usize)]) {
        match self.format {
            OutputFormat::Human => {
                if tags.is_empty() {
                    println!("No tags found.");
                    return;
                }
                for (name, count) in tags {
                    println!("{} ({})", name, count);
                }
                println!("\n{} tag(s)", tags.len());
            }
            OutputFormat::Json => {
                let json_tags: Vec<_> = tags
                    .iter()
                    .map(|(name, count)| serde_json::json!({"name": name, "count": count}))
                    .collect();
                print_json(&json_tags);
            }
            OutputFormat::Quiet => {
                for (name, _) in tags {
                    println!("{}", name);
                }
            }
        }
    }

    /// Print a cache event
    pub fn print_event(&self, event: &CacheEvent) {
        match self.format {
            OutputFormat::Human => match (event.annotation(), event.snapshot()) {
                (Some(annotation), _) => {
                    println!("· {} {}", event.kind(), annotation.fragment())
                }
                (None, Some(snapshot)) => {
                    println!("· {} ({} annotation(s))", event.kind(), snapshot.len())
                }
                (None, None) => println!("· {}", event.kind()),
            },
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": event.kind(),
                        "annotation": event.annotation().map(|a| &a.url),
                        "count": event.snapshot().map(|s| s.len()),
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}
