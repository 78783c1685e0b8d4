#[macro_use]
mod utils;

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde_json::json;

use centraldogma_engine::model::{Change, Revision};
use centraldogma_engine::watch::WatchOutcome;

#[tokio::test]
async fn happy_watch_resolves_to_new_head() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let base = repo.engine.head();

    let (_handle, watch) = repo
        .watches
        .watch_repository(
            repo.key.clone(),
            repo.engine.clone(),
            base,
            "/**",
            Duration::from_secs(3),
            false,
        )
        .context(here!("failed to register watch"))?;

    repo.engine
        .commit(
            Revision::HEAD,
            utils::author(),
            "add test3",
            vec![Change::upsert_json("/test/test3.json", json!([1, 2]))],
        )
        .await
        .context(here!("failed to push"))?;

    ensure!(
        watch.await == WatchOutcome::Value(repo.engine.head()),
        here!("watch should resolve to the new head")
    );
    Ok(())
}

#[tokio::test]
async fn unrelated_change_does_not_resolve_until_matched() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let base = repo.engine.head();

    let (_handle, watch) = repo
        .watches
        .watch_repository(
            repo.key.clone(),
            repo.engine.clone(),
            base,
            "/test/test4.json",
            Duration::from_millis(150),
            false,
        )
        .context(here!("failed to register watch"))?;

    repo.engine
        .commit(
            Revision::HEAD,
            utils::author(),
            "unrelated push",
            vec![Change::upsert_json("/test/test3.json", json!([1]))],
        )
        .await
        .context(here!("failed to push unrelated file"))?;

    ensure!(
        watch.await == WatchOutcome::TimedOut,
        here!("watch must not resolve on an unrelated path")
    );

    // Now register again and push the file the watcher actually cares about.
    let base = repo.engine.head();
    let (_handle, watch) = repo
        .watches
        .watch_repository(
            repo.key.clone(),
            repo.engine.clone(),
            base,
            "/test/test4.json",
            Duration::from_secs(3),
            false,
        )
        .context(here!("failed to re-register watch"))?;

    repo.engine
        .commit(
            Revision::HEAD,
            utils::author(),
            "matching push",
            vec![Change::upsert_json("/test/test4.json", json!([2]))],
        )
        .await
        .context(here!("failed to push matching file"))?;

    ensure!(
        watch.await == WatchOutcome::Value(repo.engine.head()),
        here!("watch should resolve once the matching path is pushed")
    );
    Ok(())
}

#[tokio::test]
async fn immediate_wake_up_for_stale_baseline() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let base = repo.engine.head();

    repo.engine
        .commit(
            Revision::HEAD,
            utils::author(),
            "push before watching",
            vec![Change::upsert_json("/a.json", json!(1))],
        )
        .await
        .context(here!("failed to push"))?;

    // Registering with the pre-push baseline must resolve synchronously.
    let (_handle, watch) = repo
        .watches
        .watch_repository(
            repo.key.clone(),
            repo.engine.clone(),
            base,
            "/**",
            Duration::from_secs(3),
            false,
        )
        .context(here!("failed to register watch"))?;

    ensure!(
        watch.await == WatchOutcome::Value(repo.engine.head()),
        here!("a stale baseline must wake up immediately")
    );
    Ok(())
}

#[tokio::test]
async fn error_on_missing_entry_fails_registration() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let err = repo
        .watches
        .watch_repository(
            repo.key.clone(),
            repo.engine.clone(),
            repo.engine.head(),
            "/does/not/exist.json",
            Duration::from_secs(3),
            true,
        )
        .unwrap_err();
    ensure!(
        matches!(err, centraldogma_engine::Error::EntryNotFound(_)),
        here!("expected entry-not-found")
    );
    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_resolves_outstanding_watches() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let (_handle, watch) = repo
        .watches
        .watch_repository(
            repo.key.clone(),
            repo.engine.clone(),
            repo.engine.head(),
            "/**",
            Duration::from_secs(60),
            false,
        )
        .context(here!("failed to register watch"))?;

    tokio::time::sleep(Duration::from_millis(20)).await;
    repo.watches.shutdown_now();

    ensure!(
        watch.await == WatchOutcome::ShuttingDown,
        here!("outstanding watch must resolve with shutting-down")
    );
    Ok(())
}
