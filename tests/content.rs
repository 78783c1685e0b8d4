#[macro_use]
mod utils;

use anyhow::{ensure, Context, Result};
use serde_json::json;

use centraldogma_engine::model::{Change, ChangeContent, CommitDetail, CommitMessage, Query, Revision};

#[tokio::test]
async fn push_read_list_and_diff() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let r = &repo.engine;

    // Push data: a JSON file and a text file in one commit.
    let push_result = r
        .commit(
            Revision::HEAD,
            utils::author(),
            "New file",
            vec![
                Change::upsert_json("/a.json", json!({"test_key": "test_value"})),
                Change::upsert_text("/b.txt", "text value\n"),
            ],
        )
        .await
        .context(here!("Failed to push file"))?;

    // Get single file
    {
        let file = r
            .get_file(push_result, &Query::of_json("/a.json").unwrap())
            .context(here!("Failed to fetch file content"))?;
        ensure!(
            matches!(&file.content, centraldogma_engine::model::EntryContent::Json(v) if *v == json!({"test_key": "test_value"})),
            here!("Expect same json content")
        );
    }

    // Get single file via JSON path
    {
        let file = r
            .get_file(
                push_result,
                &Query::of_json_path("/a.json", vec!["$.test_key".to_string()]).unwrap(),
            )
            .context(here!("Failed to fetch file content"))?;
        ensure!(
            matches!(&file.content, centraldogma_engine::model::EntryContent::Json(v) if *v == json!("test_value")),
            here!("Expect same json content")
        );
    }

    // Get multiple files
    {
        let entries = r
            .find(push_result, "a*")
            .context(here!("Failed to fetch multiple files"))?;
        ensure!(entries.len() == 1, here!("wrong number of entries returned"));

        let entries = r
            .find(push_result, "/**")
            .context(here!("Failed to fetch multiple files"))?;
        ensure!(entries.len() == 2, here!("wrong number of entries returned"));
        ensure!(
            matches!(entries.get("/b.txt").map(|e| &e.content), Some(centraldogma_engine::model::EntryContent::Text(s)) if s == "text value\n"),
            here!("Expected value not found")
        );
    }

    // Apply a JSON patch and check the resulting diff.
    {
        r.commit(
            Revision::HEAD,
            utils::author(),
            "Update a.json",
            vec![Change {
                path: "/a.json".to_string(),
                content: ChangeContent::ApplyJsonPatch(json!([
                    {"op": "replace", "path": "/test_key", "value": "updated_value"},
                    {"op": "add", "path": "/new_key", "value": ["x", "y"]}
                ])),
            }],
        )
        .await
        .context(here!("Failed to push patch"))?;

        let diffs = r
            .diff(Revision::from(1), Revision::HEAD, "/**")
            .context(here!("Failed to get diff"))?;
        ensure!(diffs.len() == 1, here!("expected a single changed path"));

        let expected = json!({"new_key": ["x", "y"], "test_key": "updated_value"});
        ensure!(
            matches!(&diffs[0].content, ChangeContent::UpsertJson(v) if *v == expected),
            here!("Diff content incorrect")
        );
    }

    Ok(())
}

#[tokio::test]
async fn commit_message_detail_round_trips() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let r = &repo.engine;
    let message = CommitMessage::with_detail(
        "Add a config file",
        CommitDetail::Markdown("Adds `/a.json` with the initial feature flags.".to_string()),
    );
    r.commit(
        Revision::HEAD,
        utils::author(),
        message.clone(),
        vec![Change::upsert_json("/a.json", json!({"enabled": true}))],
    )
    .await
    .context(here!("failed to push commit with detail"))?;

    ensure!(
        r.get_entry(Revision::HEAD, "/a.json")?.is_some(),
        here!("file from detailed commit should be readable")
    );
    Ok(())
}

#[tokio::test]
async fn preview_diff_does_not_mutate_state() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let r = &repo.engine;
    r.commit(
        Revision::HEAD,
        utils::author(),
        "seed",
        vec![Change::upsert_json("/a.json", json!({"x": 1}))],
    )
    .await?;

    let head_before = r.head();
    let preview = r.preview_diff(
        Revision::HEAD,
        vec![Change::upsert_json("/a.json", json!({"x": 2}))],
    )?;
    ensure!(preview.len() == 1, here!("preview should report one change"));
    ensure!(r.head() == head_before, here!("preview must not bump head"));
    ensure!(
        r.get_entry(Revision::HEAD, "/a.json")?.unwrap().content
            == centraldogma_engine::model::EntryContent::Json(json!({"x": 1})),
        here!("preview must not mutate the committed tree")
    );
    Ok(())
}

#[tokio::test]
async fn merge_combines_required_and_optional_sources() -> Result<()> {
    let repo = utils::new_test_repo("TestProject", "TestRepo");
    let r = &repo.engine;
    r.commit(
        Revision::HEAD,
        utils::author(),
        "seed",
        vec![
            Change::upsert_json("/foo.json", json!({"a": "bar"})),
            Change::upsert_json("/foo1.json", json!({"b": "baz"})),
            Change::upsert_json("/foo2.json", json!({"a": "new_bar"})),
        ],
    )
    .await?;

    let merged = r.merge(
        Revision::from(2),
        centraldogma_engine::merge::MergeQuery::new(vec![
            centraldogma_engine::merge::MergeSource::required("/foo.json"),
            centraldogma_engine::merge::MergeSource::required("/foo1.json"),
            centraldogma_engine::merge::MergeSource::required("/foo2.json"),
            centraldogma_engine::merge::MergeSource::optional("/foo3.json"),
        ]),
    )?;

    ensure!(
        merged.value == json!({"a": "new_bar", "b": "baz"}),
        here!("unexpected merge result")
    );
    ensure!(
        merged.contributing_paths == vec!["/foo.json", "/foo1.json", "/foo2.json"],
        here!("missing optional source should not be reported as contributing")
    );
    ensure!(merged.revision == Revision::from(2), here!("wrong merge revision"));

    // Adding a type-mismatched source is a query-execution failure.
    r.commit(
        Revision::HEAD,
        utils::author(),
        "add mismatched file",
        vec![Change::upsert_json("/foo10.json", json!({"a": 1}))],
    )
    .await?;
    let err = r
        .merge(
            Revision::HEAD,
            centraldogma_engine::merge::MergeQuery::new(vec![
                centraldogma_engine::merge::MergeSource::required("/foo.json"),
                centraldogma_engine::merge::MergeSource::required("/foo10.json"),
            ]),
        )
        .unwrap_err();
    ensure!(
        matches!(err, centraldogma_engine::Error::QueryExecution(_)),
        here!("expected a query-execution error on type mismatch")
    );
    Ok(())
}
