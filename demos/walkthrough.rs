//! Exercises the engine end to end, in-process: create a project's administrative
//! repository, register a user repository, push a commit, read it back, register a
//! watch, push again, and observe the watch resolve. Grounded on the teacher's
//! `examples/projects.rs`, which does the same narration against a live server over
//! HTTP; this binary wires the library types together directly instead.
use std::sync::Arc;
use std::time::Duration;

use centraldogma_engine::metadata::{MetadataService, Principal};
use centraldogma_engine::model::{
    Author, Change, ProjectRole, Repository, RepositoryStatus, Revision,
};
use centraldogma_engine::repository_engine::{InMemoryCommitStore, RepositoryEngine};
use centraldogma_engine::server_status::ServerStatus;
use centraldogma_engine::watch::{RepoKey, WatchManager, WatchOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let status = ServerStatus::default();
    let watches = WatchManager::new(centraldogma_engine::config::EngineConfig::default());

    // The reserved `dogma` repository holds the project's administrative documents.
    let dogma = Arc::new(RepositoryEngine::create(
        "myproject",
        "dogma",
        Author::system(),
        Arc::new(InMemoryCommitStore),
        status.clone(),
    ));
    let metadata = MetadataService::new(dogma);

    metadata
        .add_member(
            "myproject",
            "alice",
            ProjectRole::Owner,
            Author::new("alice", "alice@example.com"),
        )
        .await
        .unwrap_or_else(|e| {
            println!("(member already present: {e})");
            Revision::from(1)
        });

    let repo = Arc::new(RepositoryEngine::create(
        "myproject",
        "main",
        Author::new("alice", "alice@example.com"),
        Arc::new(InMemoryCommitStore),
        status.clone(),
    ));
    let repo_key = RepoKey::new("myproject", "main");
    repo.set_watch_sink(watches.sink_for(repo_key.clone()));

    metadata
        .register_repository(
            "myproject",
            &Repository {
                name: "main".to_string(),
                creator: Author::new("alice", "alice@example.com"),
                head_revision: repo.head(),
                created_at: chrono::Utc::now(),
                status: RepositoryStatus::Active,
                removal: None,
            },
            Author::new("alice", "alice@example.com"),
        )
        .await?;

    let role = metadata.effective_role(
        "myproject",
        &Principal::User("alice".to_string()),
        "main",
    );
    println!("alice's effective role on myproject/main: {role:?}");

    let rev = repo
        .commit(
            Revision::HEAD,
            Author::new("alice", "alice@example.com"),
            "Add settings",
            vec![Change::upsert_json(
                "/settings.json",
                serde_json::json!({"retries": 3}),
            )],
        )
        .await?;
    println!("pushed revision {rev}");

    let entry = repo.get_entry(rev, "/settings.json")?;
    println!("read back: {entry:?}");

    // Register a watch before the next push; it should resolve once that push lands.
    let base = repo.head();
    let (_handle, watch_fut) = watches.watch_repository(
        repo_key.clone(),
        repo.clone(),
        base,
        "/settings.json",
        Duration::from_secs(5),
        false,
    )?;

    let rev2 = repo
        .commit(
            Revision::HEAD,
            Author::new("alice", "alice@example.com"),
            "Bump retries",
            vec![Change::upsert_json(
                "/settings.json",
                serde_json::json!({"retries": 5}),
            )],
        )
        .await?;
    println!("pushed revision {rev2}");

    match watch_fut.await {
        WatchOutcome::Value(r) => println!("watch resolved to revision {r}"),
        other => println!("watch resolved unexpectedly: {other:?}"),
    }

    let merged = repo.merge(
        Revision::HEAD,
        centraldogma_engine::merge::MergeQuery::new(vec![
            centraldogma_engine::merge::MergeSource::required("/settings.json"),
        ]),
    )?;
    println!("merged view: {:?} (from {:?})", merged.value, merged.contributing_paths);

    Ok(())
}
