//! annocache core library
//!
//! An optimistic, event-driven local cache for the annotations of one
//! page. Reads and writes are served from memory immediately; writes are
//! reconciled with an injected backend in the background and rolled back
//! if the backend rejects them.
//!
//! # Architecture
//!
//! - **Cache**: owns the ordered sequence and runs the mutate → emit →
//!   propagate → (rollback) cycle
//! - **Events**: observer registry every change is published on
//! - **Backend**: the async contract persistence is reached through
//!
//! # Quick Start
//!
//! ```text
//! let backend = Arc::new(MemoryBackend::new());
//! let cache = AnnotationsCache::new(backend);
//!
//! cache.load("https://example.com", LoadOptions::all()).await?;
//!
//! let annotation = Annotation::new("https://example.com", "Worth rereading");
//! cache.create(annotation).wait().await?;
//! ```
//!
//! # Modules
//!
//! - `cache`: the annotations cache (main entry point)
//! - `events`: change events, subscriptions and the snapshot stream
//! - `backend`: backend contract and the in-memory backend
//! - `models`: annotation and load window
//! - `error`: cache error type
//! - `config`: application configuration

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod models;

pub use backend::{AnnotationBackend, BackendCall, BackendOperation, MemoryBackend};
pub use cache::{
    AnnotationsCache, CacheOptions, CachePhase, MutationFailure, MutationKind, MutationMode,
    PendingMutation,
};
pub use config::Config;
pub use error::{CacheError, CacheResult};
pub use events::{CacheEvent, EventKind, EventRegistry, SnapshotStream, Subscription};
pub use models::{Annotation, LoadOptions, Snapshot};
