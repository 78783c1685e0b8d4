//! Long-poll watch registration and resolution: waiters wake immediately when their
//! baseline is already stale, otherwise they register and are resolved by `broadcast()`
//! when a matching commit lands, or by timeout, cancellation, or shutdown.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{Entry, Query, Revision};
use crate::path_matcher::PathMatcher;
use crate::repository_engine::WatchSink;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Read-only view of a repository a watcher needs: current head, what changed since a
/// baseline, whether anything currently matches a pattern, and file content at a
/// revision. Implemented by `repository_engine::RepositoryEngine`.
pub trait WatchableRepo: Send + Sync {
    fn head(&self) -> Revision;
    fn touched_paths_since(&self, base: Revision) -> Vec<String>;
    fn has_match(&self, matcher: &PathMatcher) -> bool;
    fn get_file(&self, revision: Revision, query: &Query) -> Result<Entry>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoKey {
    pub project: String,
    pub repo: String,
}

impl RepoKey {
    pub fn new(project: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoKey {
            project: project.into(),
            repo: repo.into(),
        }
    }
}

/// How a watch resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome<T> {
    /// A matching change was observed; carries the new value.
    Value(T),
    /// No matching change arrived before the deadline.
    TimedOut,
    /// `WatchHandle::cancel` was called.
    Cancelled,
    /// The server began graceful shutdown before this watch resolved.
    ShuttingDown,
}

enum PendingKind {
    Repo,
    File {
        repo: Arc<dyn WatchableRepo>,
        query: Query,
        last_value: Option<Entry>,
    },
}

enum WaiterSender {
    Repo(oneshot::Sender<WatchOutcome<Revision>>),
    File(oneshot::Sender<WatchOutcome<Entry>>),
}

struct Waiter {
    id: u64,
    matcher: PathMatcher,
    kind: PendingKind,
    sender: Option<WaiterSender>,
}

#[derive(Default)]
struct RepoWatchState {
    waiters: parking_lot::Mutex<Vec<Waiter>>,
}

struct Inner {
    config: EngineConfig,
    repos: DashMap<RepoKey, Arc<RepoWatchState>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

/// A handle to cancel a previously registered watch. Cancellation is idempotent: calling
/// it after the watch already resolved, or calling it twice, is a no-op.
pub struct WatchHandle {
    manager: WatchManager,
    key: RepoKey,
    id: u64,
}

impl WatchHandle {
    pub fn cancel(&self) {
        self.manager.cancel(&self.key, self.id);
    }
}

/// The concurrency core: owns every repository's waiter set and dispatches them on
/// commit. Cheap to clone; internally reference-counted.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<Inner>,
}

impl WatchManager {
    pub fn new(config: EngineConfig) -> Self {
        WatchManager {
            inner: Arc::new(Inner {
                config,
                repos: DashMap::new(),
                next_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn state_for(&self, key: &RepoKey) -> Arc<RepoWatchState> {
        self.inner
            .repos
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RepoWatchState::default()))
            .clone()
    }

    fn handle(&self, key: RepoKey, id: u64) -> WatchHandle {
        WatchHandle {
            manager: self.clone(),
            key,
            id,
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Returns the callback a `RepositoryEngine` should invoke after every successful
    /// commit against `key`.
    pub fn sink_for(&self, key: RepoKey) -> WatchSink {
        let manager = self.clone();
        Arc::new(move |new_head: Revision, touched: Vec<String>| {
            manager.broadcast(&key, new_head, &touched);
        })
    }

    async fn await_outcome<T: Send + 'static>(
        rx: oneshot::Receiver<WatchOutcome<T>>,
        timeout: Duration,
    ) -> WatchOutcome<T> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => WatchOutcome::Cancelled,
            Err(_) => WatchOutcome::TimedOut,
        }
    }

    /// Registers (or immediately resolves) a watch on any path matching `pattern` in the
    /// repository identified by `key`, starting from baseline `base`.
    pub fn watch_repository(
        &self,
        key: RepoKey,
        repo: Arc<dyn WatchableRepo>,
        base: Revision,
        pattern: &str,
        timeout: Duration,
        error_on_missing: bool,
    ) -> Result<(WatchHandle, BoxFuture<WatchOutcome<Revision>>)> {
        let timeout = self.inner.config.clamp_watch_timeout(Some(timeout));
        let matcher = PathMatcher::compile(pattern);

        let head = repo.head();
        if base.as_i64() < head.as_i64() {
            let touched = repo.touched_paths_since(base);
            if touched.iter().any(|p| matcher.matches(p)) {
                let id = self.next_id();
                return Ok((
                    self.handle(key, id),
                    Box::pin(async move { WatchOutcome::Value(head) }),
                ));
            }
        }

        // Only consulted once the immediate-wake-up path above didn't already resolve:
        // a path that matched somewhere in (base, head] but no longer matches at head
        // (e.g. it was since removed) must still fire the immediate wake-up, not this
        // error.
        if error_on_missing && !repo.has_match(&matcher) {
            return Err(Error::EntryNotFound(pattern.to_string()));
        }

        if self.shutting_down() {
            let id = self.next_id();
            return Ok((
                self.handle(key, id),
                Box::pin(async { WatchOutcome::ShuttingDown }),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id();
        let state = self.state_for(&key);
        state.waiters.lock().push(Waiter {
            id,
            matcher,
            kind: PendingKind::Repo,
            sender: Some(WaiterSender::Repo(tx)),
        });

        Ok((self.handle(key, id), Box::pin(Self::await_outcome(rx, timeout))))
    }

    /// Registers (or immediately resolves) a watch on `query`'s result, re-notifying only
    /// when the computed value actually changes.
    pub fn watch_file(
        &self,
        key: RepoKey,
        repo: Arc<dyn WatchableRepo>,
        base: Revision,
        query: Query,
        timeout: Duration,
        error_on_missing: bool,
    ) -> Result<(WatchHandle, BoxFuture<WatchOutcome<Entry>>)> {
        let timeout = self.inner.config.clamp_watch_timeout(Some(timeout));
        let matcher = PathMatcher::compile(&query.path);

        let head = repo.head();
        let mut last_value = repo.get_file(base, &query).ok();

        if head.as_i64() > base.as_i64() {
            let touched = repo.touched_paths_since(base);
            if touched.iter().any(|p| matcher.matches(p)) {
                if let Ok(current) = repo.get_file(head, &query) {
                    if Some(&current) != last_value.as_ref() {
                        let id = self.next_id();
                        return Ok((
                            self.handle(key, id),
                            Box::pin(async move { WatchOutcome::Value(current) }),
                        ));
                    }
                    last_value = Some(current);
                }
            }
        }

        // Only consulted once the immediate-wake-up path above didn't already resolve
        // (see watch_repository for why the ordering matters).
        if error_on_missing && !repo.has_match(&matcher) {
            return Err(Error::EntryNotFound(query.path.clone()));
        }

        if self.shutting_down() {
            let id = self.next_id();
            return Ok((
                self.handle(key, id),
                Box::pin(async { WatchOutcome::ShuttingDown }),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id();
        let state = self.state_for(&key);
        state.waiters.lock().push(Waiter {
            id,
            matcher,
            kind: PendingKind::File {
                repo,
                query,
                last_value,
            },
            sender: Some(WaiterSender::File(tx)),
        });

        Ok((self.handle(key, id), Box::pin(Self::await_outcome(rx, timeout))))
    }

    /// Called by a `RepositoryEngine` after a successful commit. Resolves every waiter on
    /// `key` whose pattern matches a touched path (and, for file watchers, whose computed
    /// value actually changed), leaving the rest registered.
    pub fn broadcast(&self, key: &RepoKey, new_head: Revision, touched: &[String]) {
        let Some(state) = self.inner.repos.get(key) else {
            return;
        };
        let mut waiters = state.waiters.lock();
        let pending_before = waiters.len();
        waiters.retain_mut(|w| {
            if !touched.iter().any(|p| w.matcher.matches(p)) {
                return true;
            }
            match &mut w.kind {
                PendingKind::Repo => {
                    if let Some(WaiterSender::Repo(tx)) = w.sender.take() {
                        let _ = tx.send(WatchOutcome::Value(new_head));
                    }
                    false
                }
                PendingKind::File {
                    repo,
                    query,
                    last_value,
                } => match repo.get_file(new_head, query) {
                    Ok(entry) => {
                        if Some(&entry) != last_value.as_ref() {
                            if let Some(WaiterSender::File(tx)) = w.sender.take() {
                                let _ = tx.send(WatchOutcome::Value(entry));
                            }
                            false
                        } else {
                            true
                        }
                    }
                    Err(_) => true,
                },
            }
        });
        log::debug!(
            "{}/{}: broadcast revision {new_head} resolved {} of {pending_before} waiter(s)",
            key.project,
            key.repo,
            pending_before - waiters.len()
        );
    }

    /// Resolves and removes the waiter `id` registered on `key`, if it is still pending.
    pub fn cancel(&self, key: &RepoKey, id: u64) {
        if let Some(state) = self.inner.repos.get(key) {
            let mut waiters = state.waiters.lock();
            if let Some(pos) = waiters.iter().position(|w| w.id == id) {
                let mut w = waiters.remove(pos);
                if let Some(sender) = w.sender.take() {
                    send_terminal(sender, Terminal::Cancelled);
                }
            }
        }
    }

    /// Immediately force-resolves every outstanding waiter across every repository with
    /// `ShuttingDown`, and rejects further registrations. Call after
    /// `begin_graceful_shutdown`'s grace window elapses, or directly for an abrupt halt.
    pub fn shutdown_now(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        for entry in self.inner.repos.iter() {
            let mut waiters = entry.waiters.lock();
            for w in waiters.drain(..) {
                if let Some(sender) = w.sender {
                    send_terminal(sender, Terminal::ShuttingDown);
                }
            }
        }
    }

    /// Marks the manager as shutting down (new registrations resolve immediately with
    /// `ShuttingDown`), waits out the configured grace window, then force-resolves
    /// anything still outstanding.
    pub async fn begin_graceful_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        tokio::time::sleep(self.inner.config.shutdown_grace).await;
        self.shutdown_now();
    }

    /// Diagnostic count of outstanding waiters across all repositories.
    pub fn pending_count(&self) -> usize {
        self.inner
            .repos
            .iter()
            .map(|entry| entry.waiters.lock().len())
            .sum()
    }

    /// A continuing subscription: re-registers a repository watch with the
    /// last-observed revision as the new baseline after every resolution, yielding the
    /// new head each time. Ends when a registration errors, or the watch resolves to
    /// anything other than `Value` (timeout, cancellation, or shutdown) — a caller
    /// wanting to keep watching past a timeout re-subscribes.
    pub fn watch_repository_stream(
        &self,
        key: RepoKey,
        repo: Arc<dyn WatchableRepo>,
        base: Revision,
        pattern: impl Into<String>,
        timeout: Duration,
        error_on_missing: bool,
    ) -> impl Stream<Item = Revision> + Send {
        let pattern = pattern.into();
        let manager = self.clone();
        stream::unfold(Some(base), move |state| {
            let manager = manager.clone();
            let repo = repo.clone();
            let key = key.clone();
            let pattern = pattern.clone();
            async move {
                let base = state?;
                let (_handle, fut) = manager
                    .watch_repository(key, repo, base, &pattern, timeout, error_on_missing)
                    .ok()?;
                match fut.await {
                    WatchOutcome::Value(rev) => Some((rev, Some(rev))),
                    _ => None,
                }
            }
        })
    }

    /// Like [`watch_repository_stream`](Self::watch_repository_stream), but for a
    /// single file's query result.
    pub fn watch_file_stream(
        &self,
        key: RepoKey,
        repo: Arc<dyn WatchableRepo>,
        base: Revision,
        query: Query,
        timeout: Duration,
        error_on_missing: bool,
    ) -> impl Stream<Item = Entry> + Send {
        let manager = self.clone();
        stream::unfold(Some(base), move |state| {
            let manager = manager.clone();
            let repo = repo.clone();
            let key = key.clone();
            let query = query.clone();
            async move {
                let base = state?;
                let (_handle, fut) = manager
                    .watch_file(key, repo, base, query, timeout, error_on_missing)
                    .ok()?;
                match fut.await {
                    WatchOutcome::Value(entry) => {
                        let next_base = entry.revision;
                        Some((entry, Some(next_base)))
                    }
                    _ => None,
                }
            }
        })
    }
}

/// A watcher derived from an underlying stream of `V`s via a pure projection `f: V ->
/// W`. Notifies only when the projected value changes versus the last delivery, not on
/// every underlying change (spec.md §4.6, "transforming watcher"). `close()` detaches
/// from the upstream; after closing, `next()` keeps returning the last delivered value
/// (or `None` if nothing was ever delivered) instead of waiting on new upstream changes.
pub struct TransformingWatch<V, W> {
    upstream: Pin<Box<dyn Stream<Item = V> + Send>>,
    f: Box<dyn Fn(V) -> W + Send>,
    last: Option<W>,
    closed: bool,
}

impl<V: Send + 'static, W: Clone + PartialEq + Send + 'static> TransformingWatch<V, W> {
    pub fn new(
        upstream: impl Stream<Item = V> + Send + 'static,
        f: impl Fn(V) -> W + Send + 'static,
    ) -> Self {
        TransformingWatch {
            upstream: Box::pin(upstream),
            f: Box::new(f),
            last: None,
            closed: false,
        }
    }

    /// Detaches from the upstream. New upstream changes are ignored from this point on.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The last projected value delivered by [`next`](Self::next), if any.
    pub fn last(&self) -> Option<&W> {
        self.last.as_ref()
    }

    /// Waits for the next projected value that differs from the last one delivered.
    /// Returns `None` once closed with nothing further to deliver, or once the upstream
    /// stream ends.
    pub async fn next(&mut self) -> Option<W> {
        if self.closed {
            return None;
        }
        while let Some(v) = self.upstream.next().await {
            let w = (self.f)(v);
            if Some(&w) != self.last.as_ref() {
                self.last = Some(w.clone());
                return Some(w);
            }
        }
        None
    }
}

/// A resolution that carries no value, so it can be sent through either waiter flavor's
/// sender without knowing its payload type.
enum Terminal {
    Cancelled,
    ShuttingDown,
}

fn send_terminal(sender: WaiterSender, terminal: Terminal) {
    match sender {
        WaiterSender::Repo(tx) => {
            let _ = tx.send(match terminal {
                Terminal::Cancelled => WatchOutcome::Cancelled,
                Terminal::ShuttingDown => WatchOutcome::ShuttingDown,
            });
        }
        WaiterSender::File(tx) => {
            let _ = tx.send(match terminal {
                Terminal::Cancelled => WatchOutcome::Cancelled,
                Terminal::ShuttingDown => WatchOutcome::ShuttingDown,
            });
        }
    }
}
