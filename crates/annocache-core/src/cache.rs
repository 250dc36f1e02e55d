//! Optimistic annotations cache
//!
//! `AnnotationsCache` owns the in-memory sequence of annotations for the
//! currently loaded page and coordinates it with the backend:
//!
//! 1. A mutation updates the sequence and emits its events synchronously
//! 2. The backend call runs in a spawned Tokio task
//! 3. On failure the sequence is restored to the snapshot taken just
//!    before the mutation and `rollback` is emitted
//!
//! The task is spawned on the runtime the cache was created in, or failing
//! that the caller's runtime. With neither available the mutation is
//! rejected before anything is changed.
//!
//! ## Usage
//!
//! ```ignore
//! let cache = AnnotationsCache::new(backend);
//! cache.load("https://example.com", LoadOptions::all()).await?;
//!
//! let mut events = cache.subscribe();
//! let pending = cache.create(Annotation::new("https://example.com", "hi"));
//! // `created` and `newState` are already queued on `events` here
//! pending.wait().await?;
//! ```
//!
//! ## Mutation modes
//!
//! Rolling back to a snapshot is only exact when one propagation is in
//! flight at a time. [`MutationMode::Serialized`] (the default) sends
//! propagations to the backend one by one in call order and discards the
//! queued ones a rollback has already undone. [`MutationMode::Concurrent`]
//! lets them race; a failure then restores its own snapshot even if that
//! drops changes other propagations confirmed meanwhile.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{AnnotationBackend, BackendOperation};
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventKind, EventRegistry, SnapshotStream, Subscription};
use crate::models::{Annotation, LoadOptions, Snapshot};

/// Lifecycle of the cached scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    /// Nothing loaded yet
    Empty,
    /// A load is in flight
    Loading,
    /// A load has completed
    Loaded,
}

/// How background propagations are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    /// One propagation at a time, in call order
    #[default]
    Serialized,
    /// Propagations race each other
    Concurrent,
}

impl fmt::Display for MutationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationMode::Serialized => f.write_str("serialized"),
            MutationMode::Concurrent => f.write_str("concurrent"),
        }
    }
}

impl FromStr for MutationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serialized" => Ok(MutationMode::Serialized),
            "concurrent" => Ok(MutationMode::Concurrent),
            other => Err(format!(
                "unknown mutation mode '{}' (expected 'serialized' or 'concurrent')",
                other
            )),
        }
    }
}

/// Cache construction options
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub mutation_mode: MutationMode,
}

impl From<&Config> for CacheOptions {
    fn from(config: &Config) -> Self {
        Self {
            mutation_mode: config.mutation_mode,
        }
    }
}

/// Kind of optimistic mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => f.write_str("create"),
            MutationKind::Update => f.write_str("update"),
            MutationKind::Delete => f.write_str("delete"),
        }
    }
}

/// A background propagation that did not reach the backend successfully
#[derive(Debug, Clone, PartialEq)]
pub struct MutationFailure {
    pub kind: MutationKind,
    /// Url of the annotation the mutation targeted
    pub url: String,
    pub error: CacheError,
}

/// Handle to the background propagation of one mutation
///
/// Dropping the handle detaches the task; its outcome still reaches the
/// failure channel and the log.
#[derive(Debug)]
pub struct PendingMutation {
    kind: MutationKind,
    url: String,
    task: Task,
}

#[derive(Debug)]
enum Task {
    Spawned(JoinHandle<CacheResult<()>>),
    /// Refused before anything was applied
    Rejected(CacheError),
}

impl PendingMutation {
    /// Kind of mutation being propagated
    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    /// Url of the annotation being propagated
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the background task has finished
    pub fn is_finished(&self) -> bool {
        match &self.task {
            Task::Spawned(handle) => handle.is_finished(),
            Task::Rejected(_) => true,
        }
    }

    /// Wait for the backend to confirm or reject the mutation
    pub async fn wait(self) -> CacheResult<()> {
        let handle = match self.task {
            Task::Spawned(handle) => handle,
            Task::Rejected(error) => return Err(error),
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(CacheError::TaskAborted {
                url: self.url,
                details: e.to_string(),
            }),
        }
    }
}

#[derive(Debug)]
struct CacheState {
    annotations: Snapshot,
    scope: Option<String>,
    loaded: bool,
    loads_in_flight: usize,
    /// Bumped by every rollback
    rollback_epoch: u64,
    /// Bumped by every successful load
    load_epoch: u64,
    /// Completion signal of the most recently queued propagation
    tail: Option<oneshot::Receiver<()>>,
}

impl CacheState {
    fn phase(&self) -> CachePhase {
        if self.loads_in_flight > 0 {
            CachePhase::Loading
        } else if self.loaded {
            CachePhase::Loaded
        } else {
            CachePhase::Empty
        }
    }
}

/// Everything a propagation task needs from the synchronous phase
struct Ticket {
    before: Snapshot,
    rollback_epoch: u64,
    load_epoch: u64,
    predecessor: Option<oneshot::Receiver<()>>,
    /// Dropped when the task ends, releasing the next propagation
    _done: Option<oneshot::Sender<()>>,
}

struct CacheInner {
    backend: Arc<dyn AnnotationBackend>,
    mode: MutationMode,
    /// Runtime current when the cache was created
    runtime: Option<Handle>,
    state: Mutex<CacheState>,
    events: EventRegistry<CacheEvent>,
    failures: EventRegistry<MutationFailure>,
}

/// Optimistic cache of one page's annotations
///
/// Cloning is cheap; clones share the same state and subscribers.
#[derive(Clone)]
pub struct AnnotationsCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for AnnotationsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("AnnotationsCache")
            .field("mode", &self.inner.mode)
            .field("scope", &state.scope)
            .field("len", &state.annotations.len())
            .field("phase", &state.phase())
            .finish()
    }
}

impl AnnotationsCache {
    /// Create an empty cache with default options
    pub fn new(backend: Arc<dyn AnnotationBackend>) -> Self {
        Self::with_options(backend, CacheOptions::default())
    }

    /// Create an empty cache
    ///
    /// When called inside a Tokio runtime, propagations are spawned on that
    /// runtime even if later mutations are made from outside it.
    pub fn with_options(backend: Arc<dyn AnnotationBackend>, options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                mode: options.mutation_mode,
                runtime: Handle::try_current().ok(),
                state: Mutex::new(CacheState {
                    annotations: Arc::new(Vec::new()),
                    scope: None,
                    loaded: false,
                    loads_in_flight: 0,
                    rollback_epoch: 0,
                    load_epoch: 0,
                    tail: None,
                }),
                events: EventRegistry::new(),
                failures: EventRegistry::new(),
            }),
        }
    }

    // ==================== Loading ====================

    /// Replace the cached sequence with a page loaded from the backend
    ///
    /// Emits `load` with the new sequence. On failure the cache is left
    /// untouched and the error is returned.
    pub async fn load(&self, page_url: &str, options: LoadOptions) -> CacheResult<Snapshot> {
        debug!(page_url, ?options, "Loading annotations");
        let guard = LoadGuard::enter(&self.inner);

        let result = self.inner.backend.load(page_url, options).await;

        let mut state = self.inner.lock_state();
        guard.leave(&mut state);
        match result {
            Ok(annotations) => {
                let snapshot: Snapshot = Arc::new(annotations);
                state.annotations = snapshot.clone();
                state.scope = Some(page_url.to_string());
                state.loaded = true;
                state.load_epoch += 1;
                self.inner.emit(CacheEvent::Load(snapshot.clone()));
                info!(page_url, count = snapshot.len(), "Annotations loaded");
                Ok(snapshot)
            }
            Err(e) => {
                warn!(page_url, "Failed to load annotations: {:#}", e);
                Err(CacheError::backend(BackendOperation::Load, e))
            }
        }
    }

    // ==================== Mutations ====================

    /// Append an annotation and propagate it to the backend
    pub fn create(&self, annotation: Annotation) -> PendingMutation {
        let runtime = match self.runtime(MutationKind::Create, &annotation) {
            Ok(runtime) => runtime,
            Err(rejected) => return rejected,
        };
        let ticket = self.inner.apply(|state| {
            if state.iter().any(|a| a.url == annotation.url) {
                warn!(url = %annotation.url, "Creating annotation with a url already in the cache");
            }
            let mut next = Vec::with_capacity(state.len() + 1);
            next.extend_from_slice(state);
            next.push(annotation.clone());
            (Some(next), CacheEvent::Created(annotation.clone()))
        });
        self.spawn(&runtime, MutationKind::Create, annotation, ticket)
    }

    /// Replace an annotation in place and propagate it to the backend
    ///
    /// The first annotation with a matching url is replaced. When none
    /// matches the sequence is left as it is, but the events are still
    /// emitted and the backend is still called.
    pub fn update(&self, annotation: Annotation) -> PendingMutation {
        let runtime = match self.runtime(MutationKind::Update, &annotation) {
            Ok(runtime) => runtime,
            Err(rejected) => return rejected,
        };
        let ticket = self.inner.apply(|state| {
            let next = match state.iter().position(|a| a.url == annotation.url) {
                Some(index) => {
                    let mut next = state.to_vec();
                    next[index] = annotation.clone();
                    Some(next)
                }
                None => {
                    warn!(url = %annotation.url, "Updating annotation not in the cache");
                    None
                }
            };
            (next, CacheEvent::Updated(annotation.clone()))
        });
        self.spawn(&runtime, MutationKind::Update, annotation, ticket)
    }

    /// Remove an annotation and propagate the removal to the backend
    ///
    /// The first annotation with a matching url is removed. When none
    /// matches the sequence is left as it is, but the events are still
    /// emitted and the backend is still called.
    pub fn delete(&self, annotation: Annotation) -> PendingMutation {
        let runtime = match self.runtime(MutationKind::Delete, &annotation) {
            Ok(runtime) => runtime,
            Err(rejected) => return rejected,
        };
        let ticket = self.inner.apply(|state| {
            let next = match state.iter().position(|a| a.url == annotation.url) {
                Some(index) => {
                    let mut next = state.to_vec();
                    next.remove(index);
                    Some(next)
                }
                None => {
                    warn!(url = %annotation.url, "Deleting annotation not in the cache");
                    None
                }
            };
            (next, CacheEvent::Deleted(annotation.clone()))
        });
        self.spawn(&runtime, MutationKind::Delete, annotation, ticket)
    }

    /// Runtime to propagate on, checked before anything is applied
    fn runtime(
        &self,
        kind: MutationKind,
        annotation: &Annotation,
    ) -> Result<Handle, PendingMutation> {
        match self.inner.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => Ok(runtime),
            None => {
                warn!(%kind, url = %annotation.url, "No Tokio runtime; mutation rejected");
                Err(PendingMutation {
                    kind,
                    url: annotation.url.clone(),
                    task: Task::Rejected(CacheError::NoRuntime {
                        url: annotation.url.clone(),
                    }),
                })
            }
        }
    }

    fn spawn(
        &self,
        runtime: &Handle,
        kind: MutationKind,
        annotation: Annotation,
        ticket: Ticket,
    ) -> PendingMutation {
        let url = annotation.url.clone();
        let inner = Arc::clone(&self.inner);
        let handle = runtime.spawn(async move { inner.propagate(kind, annotation, ticket).await });
        PendingMutation {
            kind,
            url,
            task: Task::Spawned(handle),
        }
    }

    // ==================== Reads ====================

    /// The current sequence
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock_state().annotations.clone()
    }

    /// Number of cached annotations
    pub fn len(&self) -> usize {
        self.inner.lock_state().annotations.len()
    }

    /// Whether the cache holds no annotations
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a cached annotation by url
    pub fn get(&self, url: &str) -> Option<Annotation> {
        self.inner
            .lock_state()
            .annotations
            .iter()
            .find(|a| a.url == url)
            .cloned()
    }

    /// Page url of the last successful load
    pub fn scope(&self) -> Option<String> {
        self.inner.lock_state().scope.clone()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> CachePhase {
        self.inner.lock_state().phase()
    }

    /// How background propagations are scheduled
    pub fn mutation_mode(&self) -> MutationMode {
        self.inner.mode
    }

    // ==================== Subscriptions ====================

    /// Receive every change event from now on
    pub fn subscribe(&self) -> Subscription<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Receive background propagation failures from now on
    pub fn subscribe_failures(&self) -> Subscription<MutationFailure> {
        self.inner.failures.subscribe()
    }

    /// Current sequence, then every sequence produced by a later `load`
    pub fn annotations(&self) -> SnapshotStream {
        // Holding the state lock keeps a load from landing between the two
        let state = self.inner.lock_state();
        let loads = self
            .inner
            .events
            .subscribe_filtered(|event: &CacheEvent| event.kind() == EventKind::Load);
        SnapshotStream::new(state.annotations.clone(), loads)
    }

    /// Number of live event subscribers (snapshot streams included)
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CacheEvent) {
        let kind = event.kind();
        let delivered = self.events.emit(&event);
        debug!(event = %kind, subscribers = delivered, "Cache event emitted");
    }

    /// Synchronous phase shared by every mutation
    ///
    /// `change` returns the next sequence (or `None` to keep the current
    /// one) and the specific event. The swap and both emissions happen
    /// under the state lock.
    fn apply<F>(&self, change: F) -> Ticket
    where
        F: FnOnce(&[Annotation]) -> (Option<Vec<Annotation>>, CacheEvent),
    {
        let mut state = self.lock_state();
        let before = state.annotations.clone();

        let (next, event) = change(before.as_slice());
        if let Some(next) = next {
            state.annotations = Arc::new(next);
        }

        self.emit(event);
        self.emit(CacheEvent::NewState(state.annotations.clone()));

        let (predecessor, done) = match self.mode {
            MutationMode::Serialized => {
                let (tx, rx) = oneshot::channel();
                (state.tail.replace(rx), Some(tx))
            }
            MutationMode::Concurrent => (None, None),
        };

        Ticket {
            before,
            rollback_epoch: state.rollback_epoch,
            load_epoch: state.load_epoch,
            predecessor,
            _done: done,
        }
    }

    /// Background phase: reconcile one mutation with the backend
    async fn propagate(
        &self,
        kind: MutationKind,
        annotation: Annotation,
        mut ticket: Ticket,
    ) -> CacheResult<()> {
        if let Some(predecessor) = ticket.predecessor.take() {
            // A dropped sender means the predecessor finished (or panicked)
            let _ = predecessor.await;
        }

        let undone = self.mode == MutationMode::Serialized
            && self.lock_state().rollback_epoch != ticket.rollback_epoch;
        if undone {
            debug!(%kind, url = %annotation.url, "Skipping propagation undone by an earlier rollback");
            let error = CacheError::Superseded {
                url: annotation.url.clone(),
            };
            self.report(kind, &annotation, &error);
            return Err(error);
        }

        debug!(%kind, url = %annotation.url, "Propagating mutation");
        match self.call_backend(kind, &annotation).await {
            Ok(()) => {
                debug!(%kind, url = %annotation.url, "Mutation confirmed");
                Ok(())
            }
            Err(error) => {
                self.roll_back(&ticket);
                warn!(%kind, url = %annotation.url, "Mutation failed: {}", error);
                self.report(kind, &annotation, &error);
                Err(error)
            }
        }
    }

    async fn call_backend(&self, kind: MutationKind, annotation: &Annotation) -> CacheResult<()> {
        let backend = &self.backend;
        match kind {
            MutationKind::Create => backend
                .create(annotation)
                .await
                .map_err(|e| CacheError::backend(BackendOperation::Create, e)),
            MutationKind::Update => {
                backend
                    .update(annotation)
                    .await
                    .map_err(|e| CacheError::backend(BackendOperation::Update, e))?;
                backend
                    .update_tags(&annotation.url, &annotation.tags)
                    .await
                    .map_err(|e| CacheError::backend(BackendOperation::UpdateTags, e))
            }
            MutationKind::Delete => backend
                .delete(annotation)
                .await
                .map_err(|e| CacheError::backend(BackendOperation::Delete, e)),
        }
    }

    fn roll_back(&self, ticket: &Ticket) {
        let mut state = self.lock_state();
        if self.mode == MutationMode::Serialized && state.load_epoch != ticket.load_epoch {
            warn!("A load replaced the cache since this mutation; not rolling back over it");
            return;
        }
        state.annotations = ticket.before.clone();
        state.rollback_epoch += 1;
        self.emit(CacheEvent::Rollback(ticket.before.clone()));
        info!(count = ticket.before.len(), "Cache rolled back");
    }

    fn report(&self, kind: MutationKind, annotation: &Annotation, error: &CacheError) {
        self.failures.emit(&MutationFailure {
            kind,
            url: annotation.url.clone(),
            error: error.clone(),
        });
    }
}

/// Counts a load as in flight until it is explicitly left or dropped
struct LoadGuard<'a> {
    inner: &'a CacheInner,
    active: bool,
}

impl<'a> LoadGuard<'a> {
    fn enter(inner: &'a CacheInner) -> Self {
        inner.lock_state().loads_in_flight += 1;
        Self {
            inner,
            active: true,
        }
    }

    fn leave(mut self, state: &mut CacheState) {
        state.loads_in_flight -= 1;
        self.active = false;
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.inner.lock_state().loads_in_flight -= 1;
        }
    }
}
