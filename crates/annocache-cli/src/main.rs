//! annocache CLI
//!
//! Command-line interface for annocache - page annotations kept in an
//! optimistic local cache backed by a JSON file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use annocache_core::{AnnotationsCache, CacheOptions, Config, LoadOptions};

mod commands;
mod file_backend;
mod logging;
mod output;

use commands::annotation::Changes;
use file_backend::FileBackend;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "annocache")]
#[command(about = "annocache - Optimistic local cache for page annotations")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the cache events emitted while the command runs
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the annotations of a page
    #[command(alias = "ls")]
    List {
        /// Page URL
        page: String,
        /// Load at most this many annotations (defaults to page_size)
        #[arg(short, long)]
        limit: Option<usize>,
        /// Skip this many annotations
        #[arg(short, long)]
        skip: Option<usize>,
    },
    /// Annotate a page
    #[command(alias = "create")]
    Add {
        /// Page URL
        page: String,
        /// Comment text
        comment: String,
        /// Tags to add
        #[arg(short, long)]
        tag: Vec<String>,
        /// Mark the annotation as a bookmark
        #[arg(long)]
        bookmark: bool,
        /// Highlighted text the annotation refers to
        #[arg(long)]
        body: Option<String>,
    },
    /// Edit an annotation
    Edit {
        /// Page URL
        page: String,
        /// Annotation URL or ID prefix
        id: String,
        /// New comment text
        #[arg(short, long)]
        comment: Option<String>,
        /// Replace the tags (repeatable)
        #[arg(short, long)]
        tag: Option<Vec<String>>,
        /// Mark as bookmark
        #[arg(long, conflicts_with = "no_bookmark")]
        bookmark: bool,
        /// Remove the bookmark mark
        #[arg(long)]
        no_bookmark: bool,
    },
    /// Delete an annotation
    #[command(alias = "rm")]
    Delete {
        /// Page URL
        page: String,
        /// Annotation URL or ID prefix
        id: String,
    },
    /// List the tags used on a page
    Tags {
        /// Page URL
        page: String,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, mutation_mode, page_size, log_file)
        key: String,
        /// Value to set
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands don't need the cache
    if let Commands::Config { command } = &cli.command {
        logging::init(cli.verbose, None);
        return handle_config_command(command.clone(), cli.config.as_ref(), &output);
    }

    let config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    logging::init(cli.verbose, config.log_file.as_deref());

    let backend = Arc::new(FileBackend::open(config.annotations_path())?);
    debug!(path = ?backend.path(), mode = %config.mutation_mode, "Opening annotations cache");
    let cache = AnnotationsCache::with_options(backend, CacheOptions::from(&config));

    let mut events = cli.events.then(|| cache.subscribe());

    let result = run_command(cli.command, &cache, &config, &output).await;

    // Events are printed even when the command failed, so a rollback is visible
    if let Some(events) = events.as_mut() {
        for event in events.drain() {
            output.print_event(&event);
        }
    }

    result
}

async fn run_command(
    command: Commands,
    cache: &AnnotationsCache,
    config: &Config,
    output: &Output,
) -> Result<()> {
    match command {
        Commands::List { page, limit, skip } => {
            let mut options = LoadOptions::all();
            if let Some(limit) = limit.or(config.page_size) {
                options = options.limit(limit);
            }
            if let Some(skip) = skip {
                options = options.skip(skip);
            }
            commands::annotation::list(cache, &page, options, output).await
        }
        Commands::Add {
            page,
            comment,
            tag,
            bookmark,
            body,
        } => commands::annotation::add(cache, &page, comment, body, tag, bookmark, output).await,
        Commands::Edit {
            page,
            id,
            comment,
            tag,
            bookmark,
            no_bookmark,
        } => {
            let changes = Changes {
                comment,
                tags: tag,
                bookmark: match (bookmark, no_bookmark) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            commands::annotation::edit(cache, &page, &id, changes, output).await
        }
        Commands::Delete { page, id } => {
            commands::annotation::delete(cache, &page, &id, output).await
        }
        Commands::Tags { page } => commands::annotation::tags(cache, &page, output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}
