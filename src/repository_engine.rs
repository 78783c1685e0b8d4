//! The per-repository linearized commit log: applies changes, resolves conflicts,
//! serves reads at any revision, and produces diffs. The storage core of the engine.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::change_codec::{self, Effect, NormalizedChange};
use crate::error::{Error, Result};
use crate::merge::{self, MergeQuery, MergedEntry};
use crate::model::{
    Author, Change, ChangeContent, Commit, CommitMessage, Entry, EntryContent, ListEntry, Query,
    Revision,
};
use crate::path_matcher::PathMatcher;
use crate::query;
use crate::server_status::ServerStatus;
use crate::watch::WatchableRepo;

/// The durable store collaborator: persists an accepted commit and its resulting tree.
/// This crate fixes only the interface; on-disk encoding is out of scope (spec.md §1
/// Non-goals). [`InMemoryCommitStore`] is the implementation used by tests and the demo.
#[async_trait]
pub trait CommitStore: Send + Sync {
    async fn append(&self, commit: &Commit, tree: &BTreeMap<String, EntryContent>) -> Result<()>;
}

/// A `CommitStore` that keeps no state of its own — `RepositoryEngine` already holds the
/// authoritative in-memory log; this exists only to give the trait a concrete, always
/// available implementation for tests and the demo binary.
pub struct InMemoryCommitStore;

#[async_trait]
impl CommitStore for InMemoryCommitStore {
    async fn append(&self, _commit: &Commit, _tree: &BTreeMap<String, EntryContent>) -> Result<()> {
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPush(format!("path must be absolute: {path}")));
    }
    if path.len() > 4096 {
        return Err(Error::InvalidPush(format!("path too long: {path}")));
    }
    for segment in path.split('/').skip(1) {
        if segment.is_empty() {
            return Err(Error::InvalidPush(format!("empty path segment in {path}")));
        }
        if segment == ".." || segment == "." {
            return Err(Error::InvalidPush(format!("path traversal in {path}")));
        }
        if segment.len() > 255 {
            return Err(Error::InvalidPush(format!("path segment too long in {path}")));
        }
    }
    Ok(())
}

struct CommitRecord {
    commit: Commit,
    tree: Arc<BTreeMap<String, EntryContent>>,
}

struct State {
    commits: Vec<CommitRecord>,
}

/// Invoked by `commit()` with the new head revision and the set of paths touched by that
/// commit, so a `WatchManager` elsewhere in the process can dispatch waiters. Kept as a
/// plain callback rather than a direct dependency on `watch::WatchManager` so the storage
/// core and the concurrency core stay decoupled, wired together by whoever constructs
/// both (see `demos/walkthrough.rs`).
pub type WatchSink = Arc<dyn Fn(Revision, Vec<String>) + Send + Sync>;

pub struct RepositoryEngine {
    project: String,
    name: String,
    state: RwLock<State>,
    write_lock: AsyncMutex<()>,
    store: Arc<dyn CommitStore>,
    status: ServerStatus,
    watch_sink: std::sync::Mutex<Option<WatchSink>>,
}

impl RepositoryEngine {
    /// Creates a repository, seeding it with the initial (empty-tree) commit at revision 1.
    pub fn create(
        project: impl Into<String>,
        name: impl Into<String>,
        creator: Author,
        store: Arc<dyn CommitStore>,
        status: ServerStatus,
    ) -> Self {
        let initial = Commit {
            revision: Revision::INIT,
            author: creator,
            commit_message: CommitMessage::summary("Create a new repository"),
            pushed_at: Utc::now(),
            changes: Vec::new(),
        };
        let state = State {
            commits: vec![CommitRecord {
                commit: initial,
                tree: Arc::new(BTreeMap::new()),
            }],
        };
        RepositoryEngine {
            project: project.into(),
            name: name.into(),
            state: RwLock::new(state),
            write_lock: AsyncMutex::new(()),
            store,
            status,
            watch_sink: std::sync::Mutex::new(None),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the callback `commit()` invokes after a successful commit. Set once,
    /// typically right after construction, by whoever wires this engine to a
    /// `WatchManager`.
    pub fn set_watch_sink(&self, sink: WatchSink) {
        *self.watch_sink.lock().unwrap() = Some(sink);
    }

    pub fn head(&self) -> Revision {
        Revision::from(self.state.read().commits.len() as i64)
    }

    /// Maps a relative or absolute revision to its absolute form.
    pub fn normalize(&self, rev: Revision) -> Result<Revision> {
        let head = self.head().as_i64();
        let r = rev.as_i64();
        let absolute = if r <= 0 {
            let rr = if r == 0 { -1 } else { r };
            head + rr + 1
        } else {
            r
        };
        if absolute < 1 || absolute > head {
            Err(Error::RevisionNotFound(rev.as_i64()))
        } else {
            Ok(Revision::from(absolute))
        }
    }

    fn tree_at(&self, rev: Revision) -> Result<Arc<BTreeMap<String, EntryContent>>> {
        let abs = self.normalize(rev)?;
        let state = self.state.read();
        Ok(state.commits[(abs.as_i64() - 1) as usize].tree.clone())
    }

    pub fn get_entry(&self, rev: Revision, path: &str) -> Result<Option<Entry>> {
        let abs = self.normalize(rev)?;
        let tree = self.tree_at(abs)?;
        Ok(tree.get(path).map(|content| Entry {
            path: path.to_string(),
            content: content.clone(),
            revision: abs,
        }))
    }

    pub fn get_file(&self, rev: Revision, query: &Query) -> Result<Entry> {
        let abs = self.normalize(rev)?;
        let entry = self
            .get_entry(abs, &query.path)?
            .ok_or_else(|| Error::EntryNotFound(query.path.clone()))?;
        query::run(&entry, query)
    }

    /// Whether a pattern (as used by `find`) asks for synthetic directory entries: a
    /// pattern segment with no file-type suffix, e.g. a trailing `/**` or a trailing `/`.
    /// spec.md §4.4 leaves this genuinely ambiguous; this is the resolution recorded in
    /// DESIGN.md.
    fn wants_directories(pattern: &str) -> bool {
        pattern.split(',').map(str::trim).any(|clause| {
            clause.ends_with("/**") || clause == "**" || clause.ends_with('/')
        })
    }

    /// Retrieves the entries at `rev` matched by `path_pattern`, ordered by path.
    pub fn find(&self, rev: Revision, path_pattern: &str) -> Result<BTreeMap<String, Entry>> {
        let abs = self.normalize(rev)?;
        let tree = self.tree_at(abs)?;
        let matcher = PathMatcher::compile(path_pattern);
        let mut result = BTreeMap::new();
        for (path, content) in tree.iter() {
            if matcher.matches(path) {
                result.insert(
                    path.clone(),
                    Entry {
                        path: path.clone(),
                        content: content.clone(),
                        revision: abs,
                    },
                );
            }
        }
        if Self::wants_directories(path_pattern) {
            let mut dirs = BTreeSet::new();
            for path in result.keys() {
                let mut p = path.as_str();
                while let Some(idx) = p.rfind('/') {
                    if idx == 0 {
                        break;
                    }
                    p = &p[..idx];
                    dirs.insert(p.to_string());
                }
            }
            for dir in dirs {
                result
                    .entry(dir.clone())
                    .or_insert_with(|| Entry::directory(dir, abs));
            }
        }
        Ok(result)
    }

    /// Lists entries as path/type pairs (no content), matching `find` plus synthetic
    /// directories, for a directory-listing style call.
    pub fn list(&self, rev: Revision, path_pattern: &str) -> Result<Vec<ListEntry>> {
        Ok(self
            .find(rev, path_pattern)?
            .into_values()
            .map(|e| ListEntry {
                path: e.path.clone(),
                r#type: e.entry_type(),
            })
            .collect())
    }

    /// Deterministic file-level diff between two revisions, ascending by path. Never
    /// includes synthetic directory entries (spec.md §9 open question, resolved "no").
    pub fn diff(&self, from: Revision, to: Revision, path_pattern: &str) -> Result<Vec<Change>> {
        let from_tree = self.tree_at(from)?;
        let to_tree = self.tree_at(to)?;
        let matcher = PathMatcher::compile(path_pattern);

        let mut paths: BTreeSet<&String> = BTreeSet::new();
        paths.extend(from_tree.keys());
        paths.extend(to_tree.keys());

        let mut changes = Vec::new();
        for path in paths {
            if !matcher.matches(path) {
                continue;
            }
            match (from_tree.get(path), to_tree.get(path)) {
                (Some(_), None) => changes.push(Change::remove(path.clone())),
                (None, Some(to_content)) => {
                    changes.push(content_to_upsert(path.clone(), to_content))
                }
                (Some(a), Some(b)) if a != b => {
                    changes.push(content_to_upsert(path.clone(), b))
                }
                _ => {}
            }
        }
        Ok(changes)
    }

    /// Simulates applying `changes` to `base` without committing; raises the same errors
    /// a commit would.
    pub fn preview_diff(&self, base: Revision, changes: Vec<Change>) -> Result<Vec<Change>> {
        let abs = self.normalize(base)?;
        let base_tree = self.tree_at(abs)?;
        let (_, normalized) = resolve_changes(&base_tree, changes)?;
        Ok(normalized.into_iter().map(|n| n.original).collect())
    }

    /// Commits `changes` against `base`, returning the new head revision.
    pub async fn commit(
        &self,
        base: Revision,
        author: Author,
        message: impl Into<CommitMessage>,
        changes: Vec<Change>,
    ) -> Result<Revision> {
        if !self.status.current().accepts_client_writes() {
            return Err(Error::ReadOnly);
        }
        if changes.is_empty() {
            return Err(Error::InvalidPush("no changes to commit".to_string()));
        }

        let _guard = self.write_lock.lock().await;

        let head_rev = self.head();
        let head_tree = self.tree_at(head_rev)?;
        let base_abs = self.normalize(base)?;

        let (new_tree, normalized) = if base_abs.as_i64() < head_rev.as_i64() {
            log::debug!(
                "{}/{}: rebasing commit from base {base_abs} onto head {head_rev}",
                self.project,
                self.name
            );
            let base_tree = self.tree_at(base_abs)?;
            let (target_tree, normalized) = resolve_changes(&base_tree, changes)?;
            for n in &normalized {
                for path in touched_paths_of_effect(&n.effect) {
                    if base_tree.get(&path) != head_tree.get(&path) {
                        log::warn!(
                            "{}/{}: change conflict on {path} rebasing {base_abs} onto {head_rev}",
                            self.project,
                            self.name
                        );
                        return Err(Error::ChangeConflict(format!(
                            "concurrent modification of {path}"
                        )));
                    }
                }
            }
            let mut merged = (*head_tree).clone();
            apply_effects(&mut merged, &normalized);
            let _ = target_tree;
            (merged, normalized)
        } else {
            let (target_tree, normalized) = resolve_changes(&head_tree, changes)?;
            (target_tree, normalized)
        };

        if normalized.iter().all(|n| is_noop(&head_tree, &n.effect)) {
            return Err(Error::RedundantChange);
        }

        let new_rev = Revision::from(head_rev.as_i64() + 1);
        let commit = Commit {
            revision: new_rev,
            author,
            commit_message: message.into(),
            pushed_at: Utc::now(),
            changes: normalized.iter().map(|n| n.original.clone()).collect(),
        };

        self.store.append(&commit, &new_tree).await?;
        let commit_len = commit.changes.len();

        let touched: Vec<String> = normalized
            .iter()
            .flat_map(|n| touched_paths_of_effect(&n.effect))
            .collect();

        {
            let mut state = self.state.write();
            state.commits.push(CommitRecord {
                commit,
                tree: Arc::new(new_tree),
            });
        }

        log::debug!(
            "{}/{}: committed revision {new_rev} ({} change(s))",
            self.project,
            self.name,
            commit_len
        );

        if let Some(sink) = self.watch_sink.lock().unwrap().as_ref() {
            sink(new_rev, touched);
        }

        Ok(new_rev)
    }

    pub fn merge(
        &self,
        rev: Revision,
        query: MergeQuery,
    ) -> Result<MergedEntry> {
        let abs = self.normalize(rev)?;
        merge::merge(query, |path| self.get_entry(abs, path)).map(|mut m| {
            m.revision = abs;
            m
        })
    }
}

fn content_to_upsert(path: String, content: &EntryContent) -> Change {
    match content {
        EntryContent::Json(v) | EntryContent::Yaml(v) => Change {
            path,
            content: ChangeContent::UpsertJson(v.clone()),
        },
        EntryContent::Text(t) => Change {
            path,
            content: ChangeContent::UpsertText(t.clone()),
        },
        EntryContent::Directory => unreachable!("directories are never stored in the tree"),
    }
}

fn resolve_changes(
    base_tree: &BTreeMap<String, EntryContent>,
    changes: Vec<Change>,
) -> Result<(BTreeMap<String, EntryContent>, Vec<NormalizedChange>)> {
    let mut tree = base_tree.clone();
    let mut normalized = Vec::new();
    for change in changes {
        let target_path = match &change.content {
            ChangeContent::Rename(to) => Some(to.clone()),
            _ => None,
        };
        validate_path(&change.path)?;
        if let Some(to) = &target_path {
            validate_path(to)?;
        }
        let n = change_codec::normalize(change, |p| tree.get(p).cloned())?;
        apply_effect(&mut tree, &n.effect);
        normalized.push(n);
    }
    Ok((tree, normalized))
}

fn apply_effects(tree: &mut BTreeMap<String, EntryContent>, normalized: &[NormalizedChange]) {
    for n in normalized {
        apply_effect(tree, &n.effect);
    }
}

fn apply_effect(tree: &mut BTreeMap<String, EntryContent>, effect: &Effect) {
    match effect {
        Effect::Upsert { path, content } => {
            tree.insert(path.clone(), content.clone());
        }
        Effect::Remove { path } => {
            tree.remove(path);
        }
        Effect::Rename { from, to, content } => {
            tree.remove(from);
            tree.insert(to.clone(), content.clone());
        }
    }
}

fn touched_paths_of_effect(effect: &Effect) -> Vec<String> {
    match effect {
        Effect::Upsert { path, .. } => vec![path.clone()],
        Effect::Remove { path } => vec![path.clone()],
        Effect::Rename { from, to, .. } => vec![from.clone(), to.clone()],
    }
}

fn is_noop(head_tree: &BTreeMap<String, EntryContent>, effect: &Effect) -> bool {
    match effect {
        Effect::Upsert { path, content } => head_tree.get(path) == Some(content),
        Effect::Remove { .. } => false,
        Effect::Rename { .. } => false,
    }
}

pub(crate) fn touched_paths_of_commit(changes: &[Change]) -> Vec<String> {
    let mut paths = Vec::new();
    for c in changes {
        paths.push(c.path.clone());
        if let ChangeContent::Rename(to) = &c.content {
            paths.push(to.clone());
        }
    }
    paths
}

impl WatchableRepo for RepositoryEngine {
    fn head(&self) -> Revision {
        RepositoryEngine::head(self)
    }

    fn touched_paths_since(&self, base: Revision) -> Vec<String> {
        let state = self.state.read();
        let start = base.as_i64().max(0) as usize;
        state
            .commits
            .get(start..)
            .map(|slice| {
                slice
                    .iter()
                    .flat_map(|c| touched_paths_of_commit(&c.commit.changes))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn has_match(&self, matcher: &PathMatcher) -> bool {
        let state = self.state.read();
        state
            .commits
            .last()
            .map(|c| c.tree.keys().any(|p| matcher.matches(p)))
            .unwrap_or(false)
    }

    fn get_file(&self, revision: Revision, query: &Query) -> Result<Entry> {
        RepositoryEngine::get_file(self, revision, query)
    }
}
