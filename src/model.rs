//! Data models of the configuration repository.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A revision number of a [`Commit`].
///
/// A revision number is an integer which refers to a specific point of repository history.
/// When a repository is created, it starts with an initial commit whose revision is 1.
/// As new commits are added, each commit gets its own revision number,
/// monotonically increasing from the previous commit's revision. i.e. 1, 2, 3, ...
///
/// A revision number can also be represented as a negative integer.
/// When a revision number is negative, we start from -1 which refers to the latest commit in
/// repository history, which is often called 'HEAD' of the repository.
/// A smaller revision number refers to the older commit.
/// e.g. -2 refers to the commit before the latest commit, and so on.
///
/// A revision with a negative integer is called 'relative revision'.
/// By contrast, a revision with a positive integer is called 'absolute revision'.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(i64);

impl Revision {
    /// Revision `-1`, also known as `HEAD`.
    pub const HEAD: Revision = Revision(-1);
    /// Revision `1`, also known as `INIT`.
    pub const INIT: Revision = Revision(1);

    /// Create a new instance with the specified revision number.
    pub fn from(i: i64) -> Self {
        Revision(i)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// `true` for `0` and negative revisions, which are relative to head.
    pub fn is_relative(&self) -> bool {
        self.0 <= 0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creator, or modifier, of a project, a repository, a commit or a metadata entity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    /// Name of this author.
    pub name: String,
    /// Email of this author.
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Author {
            name: name.into(),
            email: email.into(),
        }
    }

    /// The author used internally for system-generated commits (e.g. metadata
    /// row reconciliation).
    pub fn system() -> Self {
        Author::new("System", "system@localhost")
    }
}

/// A soft-deletion marker left on a project or repository; physically removing the
/// underlying data is a distinct, later "purge" step.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemovalMarker {
    pub by: Author,
    pub at: DateTime<Utc>,
}

/// A top-level element in the storage model. A project has `dogma` (administrative) and
/// `meta` (user-facing administrative) repositories by default.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Name of this project.
    pub name: String,
    /// The author who initially created this project.
    pub creator: Author,
    /// When the project was created.
    pub created_at: DateTime<Utc>,
    /// Present once the project has been soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal: Option<RemovalMarker>,
}

impl Project {
    pub fn is_active(&self) -> bool {
        self.removal.is_none()
    }
}

/// Status of a [`Repository`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepositoryStatus {
    Active,
    ReadOnly,
}

/// Repository information.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Name of this repository.
    pub name: String,
    /// The author who initially created this repository.
    pub creator: Author,
    /// Head [`Revision`] of the repository.
    pub head_revision: Revision,
    /// When the repository was created.
    pub created_at: DateTime<Utc>,
    pub status: RepositoryStatus,
    /// Present once the repository has been soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal: Option<RemovalMarker>,
}

impl Repository {
    pub fn is_active(&self) -> bool {
        self.removal.is_none() && matches!(self.status, RepositoryStatus::Active)
    }
}

/// Reserved repository holding administrative metadata (`/metadata.json`, `/tokens.json`).
pub const DOGMA_REPO: &str = "dogma";
/// Reserved, user-facing administrative repository.
pub const META_REPO: &str = "meta";

pub fn is_reserved_repo_name(name: &str) -> bool {
    name == DOGMA_REPO || name == META_REPO
}

/// The content of an [`Entry`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum EntryContent {
    /// Content as a JSON value.
    Json(serde_json::Value),
    /// Content as a JSON value that was sourced from a YAML document; merge output keeps
    /// this distinct from [`EntryContent::Json`] so the merged type can track its input
    /// family (see merge.rs).
    Yaml(serde_json::Value),
    /// Content as a string.
    Text(String),
    /// This entry is a directory. Directories are implicit/synthetic, never stored.
    Directory,
}

/// The type of an [`Entry`] or [`ListEntry`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Json,
    Text,
    Directory,
}

/// A file or a directory in a repository, at a specific revision.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Path of this entry (absolute, POSIX-style).
    pub path: String,
    /// Content of this entry.
    #[serde(flatten)]
    pub content: EntryContent,
    /// Revision this entry was read at.
    pub revision: Revision,
}

impl Entry {
    pub fn entry_type(&self) -> EntryType {
        match self.content {
            EntryContent::Json(_) | EntryContent::Yaml(_) => EntryType::Json,
            EntryContent::Text(_) => EntryType::Text,
            EntryContent::Directory => EntryType::Directory,
        }
    }

    pub fn directory(path: impl Into<String>, revision: Revision) -> Self {
        Entry {
            path: path.into(),
            content: EntryContent::Directory,
            revision,
        }
    }
}

/// Metadata of a file or a directory; has no content, used by
/// [`find`](crate::repository_engine::RepositoryEngine::find).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub path: String,
    pub r#type: EntryType,
}

/// Type of a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryType {
    Identity,
    OfText,
    OfJson,
    JsonPath(Vec<String>),
}

/// A query against the content of a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub path: String,
    pub r#type: QueryType,
}

impl Query {
    fn normalize_path(path: &str) -> String {
        if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{}", path)
        }
    }

    /// Returns the raw entry as it is. Returns `None` if `path` is empty.
    pub fn identity(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::Identity,
        })
    }

    /// Returns the textual content: JSON/YAML trees are serialized to canonical text.
    pub fn of_text(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::OfText,
        })
    }

    /// Returns the content parsed as JSON (YAML is auto-converted).
    pub fn of_json(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::OfJson,
        })
    }

    /// Applies a series of JSON path expressions to the content, each taking the prior
    /// result as input. Returns `None` if `path` does not end with `.json`.
    pub fn of_json_path(path: &str, exprs: Vec<String>) -> Option<Self> {
        if !path.to_lowercase().ends_with("json") {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::JsonPath(exprs),
        })
    }
}

/// Typed content of a [`CommitMessage`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "markup", content = "detail")]
pub enum CommitDetail {
    Markdown(String),
    Plaintext(String),
}

/// Description of a [`Commit`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitMessage {
    pub summary: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub detail: Option<CommitDetail>,
}

impl CommitMessage {
    pub fn summary(summary: impl Into<String>) -> Self {
        CommitMessage {
            summary: summary.into(),
            detail: None,
        }
    }

    pub fn with_detail(summary: impl Into<String>, detail: CommitDetail) -> Self {
        CommitMessage {
            summary: summary.into(),
            detail: Some(detail),
        }
    }
}

impl From<&str> for CommitMessage {
    fn from(summary: &str) -> Self {
        CommitMessage::summary(summary)
    }
}

impl From<String> for CommitMessage {
    fn from(summary: String) -> Self {
        CommitMessage::summary(summary)
    }
}

/// Result of a [`commit`](crate::repository_engine::RepositoryEngine::commit) operation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub revision: Revision,
    pub pushed_at: DateTime<Utc>,
}

/// Typed content of a [`Change`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum ChangeContent {
    /// Adds a new JSON file or replaces an existing file with the provided JSON.
    UpsertJson(serde_json::Value),
    /// Adds a new text file or replaces an existing file with the provided content.
    UpsertText(String),
    /// Removes an existing file. Fails with `change-conflict` if the path does not exist.
    Remove,
    /// Renames an existing file to the provided path.
    Rename(String),
    /// Applies an RFC 6902 JSON patch, plus a `test-absence` extension operation.
    ApplyJsonPatch(serde_json::Value),
    /// Applies a unified-diff text patch.
    ApplyTextPatch(String),
}

/// A modification of an individual [`Entry`], as supplied by a caller.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub path: String,
    #[serde(flatten)]
    pub content: ChangeContent,
}

impl Change {
    pub fn upsert_json(path: impl Into<String>, json: serde_json::Value) -> Self {
        Change {
            path: path.into(),
            content: ChangeContent::UpsertJson(json),
        }
    }

    pub fn upsert_text(path: impl Into<String>, text: impl Into<String>) -> Self {
        Change {
            path: path.into(),
            content: ChangeContent::UpsertText(text.into()),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Change {
            path: path.into(),
            content: ChangeContent::Remove,
        }
    }

    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Self {
        Change {
            path: from.into(),
            content: ChangeContent::Rename(to.into()),
        }
    }
}

/// A set of changes and its metadata, as recorded in the commit log.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub revision: Revision,
    pub author: Author,
    pub commit_message: CommitMessage,
    pub pushed_at: DateTime<Utc>,
    pub changes: Vec<Change>,
}

/// A change result from a `watch_file` operation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WatchFileResult {
    pub revision: Revision,
    pub entry: Entry,
}

/// A change result from a `watch_repository` operation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct WatchRepoResult {
    pub revision: Revision,
}

pub(crate) trait Watchable: Clone + Send + 'static {
    fn revision(&self) -> Revision;
}

impl Watchable for WatchFileResult {
    fn revision(&self) -> Revision {
        self.revision
    }
}

impl Watchable for WatchRepoResult {
    fn revision(&self) -> Revision {
        self.revision
    }
}

/// Effective role of a principal over a repository. Ordered `None < Read < Write < Admin`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    None,
    Read,
    Write,
    Admin,
}

/// Project-wide role of a member.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectRole {
    Owner,
    Member,
    Guest,
}

impl ProjectRole {
    /// `Owner` maps directly to `Admin` on every repository in the project; `Member`/`Guest`
    /// fall back to the repository's own project-role map (see metadata.rs).
    pub fn as_repo_role(&self) -> Option<Role> {
        match self {
            ProjectRole::Owner => Some(Role::Admin),
            ProjectRole::Member | ProjectRole::Guest => None,
        }
    }
}

/// A member of a project's metadata.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub role: ProjectRole,
    pub added_by: Author,
    pub added_at: DateTime<Utc>,
}

/// An application credential.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub app_id: String,
    pub secret: String,
    pub is_system_admin: bool,
    #[serde(default = "default_true_for_legacy_tokens")]
    pub allow_guest_access: bool,
    pub creation: Author,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivation: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion: Option<DateTime<Utc>>,
}

/// Legacy documents omit `allowGuestAccess`; the source defaulted that to `true`. This
/// default applies only when *deserializing* a pre-existing document — freshly created
/// non-admin tokens must set the field explicitly to `false` (see DESIGN.md).
fn default_true_for_legacy_tokens() -> bool {
    true
}

impl Token {
    pub fn is_purge_eligible(&self) -> bool {
        self.deletion.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.deactivation.is_none() && self.deletion.is_none()
    }
}

pub const TOKEN_SECRET_PREFIX: &str = "appToken-";

/// Roles granted on a repository: project-wide defaults plus per-principal overrides.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRoles {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_member_role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_guest_role: Option<Role>,
    #[serde(default)]
    pub users: BTreeMap<String, Role>,
    #[serde(default)]
    pub tokens: BTreeMap<String, Role>,
}

/// Per-repository metadata row.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryMetadata {
    pub name: String,
    pub roles: RepositoryRoles,
    pub creation: Author,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal: Option<RemovalMarker>,
    pub status: RepositoryStatus,
}
