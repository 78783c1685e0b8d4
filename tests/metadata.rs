#[macro_use]
mod utils;

use anyhow::{ensure, Context, Result};
use chrono::Utc;

use centraldogma_engine::metadata::{MetadataService, Principal};
use centraldogma_engine::model::{ProjectRole, Repository, RepositoryStatus, Revision, Role};

fn service() -> MetadataService {
    let repo = utils::new_test_repo("dogma", "dogma");
    MetadataService::new(repo.engine)
}

async fn seed(svc: &MetadataService, project: &str) -> Result<()> {
    svc.add_member(project, "seed-owner", ProjectRole::Owner, utils::author())
        .await
        .context(here!("failed to seed project via first owner"))?;
    Ok(())
}

#[tokio::test]
async fn repository_registration_and_removal() -> Result<()> {
    let svc = service();
    seed(&svc, "myproject").await?;

    svc.register_repository(
        "myproject",
        &Repository {
            name: "main".to_string(),
            creator: utils::author(),
            head_revision: Revision::from(1),
            created_at: Utc::now(),
            status: RepositoryStatus::Active,
            removal: None,
        },
        utils::author(),
    )
    .await
    .context(here!("failed to register repository"))?;

    let doc = svc
        .get_project_metadata("myproject")
        .context(here!("project metadata missing"))?;
    ensure!(doc.repos.contains_key("main"), here!("repository missing from doc"));

    // Re-registering the same name is a conflict.
    let err = svc
        .register_repository(
            "myproject",
            &Repository {
                name: "main".to_string(),
                creator: utils::author(),
                head_revision: Revision::from(1),
                created_at: Utc::now(),
                status: RepositoryStatus::Active,
                removal: None,
            },
            utils::author(),
        )
        .await
        .unwrap_err();
    ensure!(
        matches!(err, centraldogma_engine::Error::RepositoryExists(_)),
        here!("expected repository-exists")
    );

    svc.remove_repository("myproject", "main", utils::author())
        .await
        .context(here!("failed to remove repository"))?;
    let doc = svc.get_project_metadata("myproject")?;
    ensure!(
        doc.repos.get("main").unwrap().removal.is_some(),
        here!("repository should be soft-deleted, not dropped")
    );

    Ok(())
}

#[tokio::test]
async fn effective_role_escalates_from_repository_grant() -> Result<()> {
    let svc = service();
    seed(&svc, "myproject").await?;
    svc.add_member("myproject", "carol", ProjectRole::Member, utils::author())
        .await
        .context(here!("failed to add member"))?;
    svc.register_repository(
        "myproject",
        &Repository {
            name: "main".to_string(),
            creator: utils::author(),
            head_revision: Revision::from(1),
            created_at: Utc::now(),
            status: RepositoryStatus::Active,
            removal: None,
        },
        utils::author(),
    )
    .await?;

    // A plain member has no role on a repository until granted one, or a project-wide
    // default is configured.
    let role = svc.effective_role("myproject", &Principal::User("carol".to_string()), "main");
    ensure!(role == Role::None, here!("unexpected default role"));

    svc.set_user_repository_role("myproject", "main", "carol", Role::Write, utils::author())
        .await
        .context(here!("failed to grant repository role"))?;
    let role = svc.effective_role("myproject", &Principal::User("carol".to_string()), "main");
    ensure!(role == Role::Write, here!("grant did not take effect"));

    Ok(())
}

/// Mirrors the "Token lifecycle" scenario: create a non-admin token, destroy it
/// (soft-delete), purge it, and confirm it disappears from both lookup paths.
#[tokio::test]
async fn token_lifecycle_purges_cleanly() -> Result<()> {
    let svc = service();
    let (token, _) = svc
        .create_token("forAdmin1", false, false, utils::author())
        .await
        .context(here!("failed to create token"))?;
    ensure!(
        token.secret.starts_with(centraldogma_engine::model::TOKEN_SECRET_PREFIX),
        here!("token secret missing expected prefix")
    );

    // Purging before deletion fails: the token is still active.
    let err = svc
        .purge_token("forAdmin1", utils::author())
        .await
        .unwrap_err();
    ensure!(
        matches!(err, centraldogma_engine::Error::TokenNotFound),
        here!("purge of an active token must fail")
    );

    svc.delete_token("forAdmin1", utils::author())
        .await
        .context(here!("failed to delete token"))?;
    let tokens = svc.list_tokens()?;
    ensure!(
        tokens.iter().any(|t| t.app_id == "forAdmin1" && t.deletion.is_some()),
        here!("token should carry a deletion marker after delete, before purge")
    );

    svc.purge_token("forAdmin1", utils::author())
        .await
        .context(here!("failed to purge token"))?;
    let tokens = svc.list_tokens()?;
    ensure!(
        !tokens.iter().any(|t| t.app_id == "forAdmin1"),
        here!("purged token must be gone from the id map")
    );

    let err = svc
        .deactivate_token("forAdmin1", utils::author())
        .await
        .unwrap_err();
    ensure!(
        matches!(err, centraldogma_engine::Error::TokenNotFound),
        here!("a purged token must not be found by any subsequent lookup")
    );

    Ok(())
}

#[tokio::test]
async fn reconcile_adds_missing_rows_exactly_once() -> Result<()> {
    let svc = service();
    seed(&svc, "myproject").await?;

    let known = vec![
        Repository {
            name: "main".to_string(),
            creator: utils::author(),
            head_revision: Revision::from(1),
            created_at: Utc::now(),
            status: RepositoryStatus::Active,
            removal: None,
        },
        Repository {
            name: "secondary".to_string(),
            creator: utils::author(),
            head_revision: Revision::from(1),
            created_at: Utc::now(),
            status: RepositoryStatus::Active,
            removal: None,
        },
    ];

    let doc = svc
        .reconcile("myproject", &known, utils::author())
        .await
        .context(here!("reconcile should add the missing rows"))?;
    ensure!(doc.repos.contains_key("main"), here!("main row missing"));
    ensure!(doc.repos.contains_key("secondary"), here!("secondary row missing"));

    let rev_after_first = svc.get_project_metadata("myproject")?;
    // Reconciling again with the same known set must not add duplicate rows or error.
    let doc2 = svc
        .reconcile("myproject", &known, utils::author())
        .await
        .context(here!("reconcile must be idempotent"))?;
    ensure!(
        doc2.repos.len() == rev_after_first.repos.len(),
        here!("re-reconciling should not add duplicate rows")
    );
    Ok(())
}

#[tokio::test]
async fn purged_token_disappears_from_secret_lookup() -> Result<()> {
    let svc = service();
    let (token, _) = svc
        .create_token("forAdmin2", true, false, utils::author())
        .await
        .context(here!("failed to create token"))?;

    ensure!(
        svc.find_by_secret(&token.secret)?.is_some(),
        here!("token should be found by its secret right after creation")
    );

    svc.delete_token("forAdmin2", utils::author()).await?;
    svc.purge_token("forAdmin2", utils::author()).await?;

    ensure!(
        svc.find_by_secret(&token.secret)?.is_none(),
        here!("purged token must be gone from the secret reverse map too")
    );
    Ok(())
}
