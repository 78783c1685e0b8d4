//! `centraldogma-engine`: the storage and notification core of a versioned
//! configuration repository service.
//!
//! A caller organizes configuration into **projects**, each holding named
//! **repositories** whose content is a tree of text/JSON/YAML files versioned
//! as a sequence of immutable numbered revisions
//! ([`repository_engine::RepositoryEngine`]). Commits are pushed atomically
//! ([`change_codec`]), files can be read at any revision or queried by JSON
//! path ([`query`]), several files can be merged into one document
//! ([`merge`]), and callers can long-poll for the next change to a file or a
//! path pattern ([`watch::WatchManager`]). An access-control/metadata layer
//! ([`metadata::MetadataService`]) stores projects, repositories, members,
//! and tokens as ordinary JSON documents on a reserved administrative
//! repository, gated by a process-wide [`server_status::ServerStatus`].
//!
//! This crate has no HTTP listener, CLI, or on-disk format of its own — it
//! fixes the interfaces a router, a CLI, or a durability layer would call.
//! See `demos/walkthrough.rs` for an in-process, end-to-end example.

pub mod change_codec;
pub mod config;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod model;
pub mod path_matcher;
pub mod query;
pub mod repository_engine;
pub mod server_status;
pub mod watch;

pub use error::{Error, Result};
