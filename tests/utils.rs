#[macro_export]
macro_rules! here {
    ($e:expr) => {
        format!(
            "{}: {}",
            concat!("at ", file!(), ":", line!(), ":", column!()),
            $e
        );
    };
}

use std::sync::Arc;

use centraldogma_engine::config::EngineConfig;
use centraldogma_engine::model::Author;
use centraldogma_engine::repository_engine::{InMemoryCommitStore, RepositoryEngine};
use centraldogma_engine::server_status::ServerStatus;
use centraldogma_engine::watch::{RepoKey, WatchManager};

/// A repository wired to its own watch manager, the way a real server wires every
/// repository it serves: `RepositoryEngine::commit` invokes the sink the manager hands
/// back from `sink_for`, so a push is immediately visible to registered watchers.
pub struct TestRepo {
    pub engine: Arc<RepositoryEngine>,
    pub watches: WatchManager,
    pub key: RepoKey,
}

pub fn new_test_repo(project: &str, repo: &str) -> TestRepo {
    let watches = WatchManager::new(EngineConfig::default());
    let engine = Arc::new(RepositoryEngine::create(
        project,
        repo,
        Author::new("tester", "tester@example.com"),
        Arc::new(InMemoryCommitStore),
        ServerStatus::default(),
    ));
    let key = RepoKey::new(project, repo);
    engine.set_watch_sink(watches.sink_for(key.clone()));
    TestRepo {
        engine,
        watches,
        key,
    }
}

pub fn author() -> Author {
    Author::new("tester", "tester@example.com")
}
