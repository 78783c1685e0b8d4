//! The domain error taxonomy shared by every component of the engine.
//!
//! Modeled on the teacher's `centraldogma::Error` (a `thiserror` enum with one variant per
//! failure kind) but carrying the *kinds*, not transport-level failures — this crate has no
//! HTTP client of its own. A collaborator HTTP layer maps [`ErrorKind`] to a status code via
//! [`ErrorKind::http_status`] instead of this crate depending on an HTTP framework.
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("repository not found: {0}/{1}")]
    RepositoryNotFound(String, String),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("revision not found: {0}")]
    RevisionNotFound(i64),

    #[error("change conflict: {0}")]
    ChangeConflict(String),

    #[error("redundant change: commit would not change any state")]
    RedundantChange,

    #[error("project already exists: {0}")]
    ProjectExists(String),

    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("query execution failed: {0}")]
    QueryExecution(String),

    #[error("malformed change: {0}")]
    ChangeFormat(String),

    #[error("invalid push: {0}")]
    InvalidPush(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("token not found")]
    TokenNotFound,

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("server is read-only")]
    ReadOnly,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("request already timed out")]
    RequestAlreadyTimedOut,
}

/// HTTP status a collaborator transport layer would map this error kind to, per the wire
/// API's error taxonomy table. Not used internally — the engine never raises HTTP errors.
impl Error {
    pub fn http_status(&self) -> u16 {
        match self {
            Error::ProjectNotFound(_)
            | Error::RepositoryNotFound(_, _)
            | Error::EntryNotFound(_)
            | Error::RevisionNotFound(_)
            | Error::TokenNotFound
            | Error::MemberNotFound(_) => 404,
            Error::ChangeConflict(_) | Error::RedundantChange => 409,
            Error::ProjectExists(_) | Error::RepositoryExists(_) => 409,
            Error::QueryExecution(_) | Error::ChangeFormat(_) | Error::InvalidPush(_) => 400,
            Error::Permission(_) => 403,
            Error::Authorization(_) => 401,
            Error::ReadOnly | Error::ShuttingDown | Error::RequestAlreadyTimedOut => 503,
        }
    }

    /// Short machine-readable kind name, used as the `exception` field of the wire error
    /// body this crate's error maps onto.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::ProjectNotFound(_) => "project-not-found",
            Error::RepositoryNotFound(_, _) => "repository-not-found",
            Error::EntryNotFound(_) => "entry-not-found",
            Error::RevisionNotFound(_) => "revision-not-found",
            Error::ChangeConflict(_) => "change-conflict",
            Error::RedundantChange => "redundant-change",
            Error::ProjectExists(_) => "project-exists",
            Error::RepositoryExists(_) => "repository-exists",
            Error::QueryExecution(_) => "query-execution",
            Error::ChangeFormat(_) => "change-format",
            Error::InvalidPush(_) => "invalid-push",
            Error::Permission(_) => "permission",
            Error::Authorization(_) => "authorization",
            Error::TokenNotFound => "token-not-found",
            Error::MemberNotFound(_) => "member-not-found",
            Error::ReadOnly => "read-only",
            Error::ShuttingDown => "shutting-down",
            Error::RequestAlreadyTimedOut => "request-already-timed-out",
        }
    }
}
