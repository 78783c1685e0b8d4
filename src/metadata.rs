//! Project/repository/member/token bookkeeping, stored as plain JSON in the reserved
//! `dogma` repository (`/metadata.json` for projects, `/repos`, and `/members`;
//! `/tokens.json` for application tokens) and committed through the same
//! [`RepositoryEngine`](crate::repository_engine::RepositoryEngine) every other write
//! goes through, so metadata changes get the same optimistic-concurrency and watch
//! notification behavior as content changes.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::model::{
    Author, Member, ProjectRole, RemovalMarker, Repository, RepositoryMetadata, RepositoryRoles,
    RepositoryStatus, Revision, Role, Token, TOKEN_SECRET_PREFIX,
};
use crate::repository_engine::RepositoryEngine;

const METADATA_PATH: &str = "/metadata.json";
const TOKENS_PATH: &str = "/tokens.json";
/// Bounded retry count for the optimistic read-modify-write loop every mutation below
/// uses; a `ChangeConflict` means another writer committed between our read and commit.
const MAX_RETRIES: u32 = 8;

/// The administrative document backing one project: its members and the metadata row of
/// each of its repositories.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadataDoc {
    pub members: Vec<Member>,
    pub repos: BTreeMap<String, RepositoryMetadata>,
}

/// A principal whose effective role can be computed: either a logged-in user, or an
/// application token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User(String),
    Token(Token),
}

pub struct MetadataService {
    dogma: Arc<RepositoryEngine>,
    reconcile_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl MetadataService {
    pub fn new(dogma: Arc<RepositoryEngine>) -> Self {
        MetadataService {
            dogma,
            reconcile_locks: DashMap::new(),
        }
    }

    fn read_all_projects(&self) -> Result<BTreeMap<String, ProjectMetadataDoc>> {
        match self.dogma.get_entry(Revision::HEAD, METADATA_PATH)? {
            Some(entry) => {
                let value = match &entry.content {
                    crate::model::EntryContent::Json(v) | crate::model::EntryContent::Yaml(v) => {
                        v.clone()
                    }
                    _ => {
                        return Err(Error::ChangeFormat(format!(
                            "{METADATA_PATH} is not a JSON file"
                        )))
                    }
                };
                serde_json::from_value(value)
                    .map_err(|e| Error::ChangeFormat(format!("malformed {METADATA_PATH}: {e}")))
            }
            None => Ok(BTreeMap::new()),
        }
    }

    fn read_all_tokens(&self) -> Result<Vec<Token>> {
        match self.dogma.get_entry(Revision::HEAD, TOKENS_PATH)? {
            Some(entry) => {
                let value = match &entry.content {
                    crate::model::EntryContent::Json(v) | crate::model::EntryContent::Yaml(v) => {
                        v.clone()
                    }
                    _ => {
                        return Err(Error::ChangeFormat(format!(
                            "{TOKENS_PATH} is not a JSON file"
                        )))
                    }
                };
                serde_json::from_value(value)
                    .map_err(|e| Error::ChangeFormat(format!("malformed {TOKENS_PATH}: {e}")))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Retries `mutate` against a fresh snapshot of `/metadata.json` until it commits or
    /// `MAX_RETRIES` optimistic-concurrency conflicts are exhausted.
    async fn mutate_projects(
        &self,
        author: Author,
        summary: &str,
        mutate: impl Fn(&mut BTreeMap<String, ProjectMetadataDoc>) -> Result<()>,
    ) -> Result<Revision> {
        let mut attempt = 0;
        loop {
            let base = self.dogma.head();
            let mut projects = self.read_all_projects()?;
            mutate(&mut projects)?;
            let change = crate::model::Change::upsert_json(
                METADATA_PATH,
                serde_json::to_value(&projects)
                    .map_err(|e| Error::ChangeFormat(format!("failed to encode metadata: {e}")))?,
            );
            match self
                .dogma
                .commit(base, author.clone(), summary, vec![change])
                .await
            {
                Ok(rev) => return Ok(rev),
                Err(Error::ChangeConflict(_)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    log::debug!("{METADATA_PATH}: retrying after conflict (attempt {attempt})");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mutate_tokens(
        &self,
        author: Author,
        summary: &str,
        mutate: impl Fn(&mut Vec<Token>) -> Result<()>,
    ) -> Result<Revision> {
        let mut attempt = 0;
        loop {
            let base = self.dogma.head();
            let mut tokens = self.read_all_tokens()?;
            mutate(&mut tokens)?;
            let change = crate::model::Change::upsert_json(
                TOKENS_PATH,
                serde_json::to_value(&tokens)
                    .map_err(|e| Error::ChangeFormat(format!("failed to encode tokens: {e}")))?,
            );
            match self
                .dogma
                .commit(base, author.clone(), summary, vec![change])
                .await
            {
                Ok(rev) => return Ok(rev),
                Err(Error::ChangeConflict(_)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    log::debug!("{TOKENS_PATH}: retrying after conflict (attempt {attempt})");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn get_project_metadata(&self, project: &str) -> Result<ProjectMetadataDoc> {
        self.read_all_projects()?
            .remove(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))
    }

    /// Ensures every repository in `known_repositories` (the set the caller's repository
    /// registry considers real, e.g. every `RepositoryEngine` it has constructed for this
    /// project) has a metadata row, adding the missing ones exactly once. Concurrent
    /// callers for the same project single-flight onto one `reconcile_locks` entry so two
    /// readers racing to add the same row don't both commit; the loser's
    /// `RepositoryExists` is swallowed and treated as success, per spec.md §3/§4.7.
    pub async fn reconcile(
        &self,
        project: &str,
        known_repositories: &[Repository],
        author: Author,
    ) -> Result<ProjectMetadataDoc> {
        let lock = self
            .reconcile_locks
            .entry(project.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let doc = self.get_project_metadata(project)?;
        let missing: Vec<&Repository> = known_repositories
            .iter()
            .filter(|r| !doc.repos.contains_key(&r.name))
            .collect();

        if missing.is_empty() {
            return Ok(doc);
        }

        log::debug!(
            "{project}: reconciling {} missing metadata row(s)",
            missing.len()
        );
        for repo in missing {
            match self
                .register_repository(project, repo, author.clone())
                .await
            {
                Ok(_) => {}
                Err(Error::RepositoryExists(_)) => {
                    log::debug!(
                        "{project}/{}: row added concurrently by another reconciler",
                        repo.name
                    );
                }
                Err(e) => return Err(e),
            }
        }
        self.get_project_metadata(project)
    }

    pub async fn add_member(
        &self,
        project: &str,
        user_id: &str,
        role: ProjectRole,
        added_by: Author,
    ) -> Result<Revision> {
        let project = project.to_string();
        let user_id = user_id.to_string();
        let added_by2 = added_by.clone();
        self.mutate_projects(added_by, "Add a project member", move |projects| {
            let doc = projects
                .get_mut(&project)
                .ok_or_else(|| Error::ProjectNotFound(project.clone()))?;
            if doc.members.iter().any(|m| m.user_id == user_id) {
                return Err(Error::InvalidPush(format!(
                    "{user_id} is already a member of {project}"
                )));
            }
            doc.members.push(Member {
                user_id: user_id.clone(),
                role,
                added_by: added_by2.clone(),
                added_at: Utc::now(),
            });
            Ok(())
        })
        .await
    }

    pub async fn remove_member(
        &self,
        project: &str,
        user_id: &str,
        author: Author,
    ) -> Result<Revision> {
        let project_owned = project.to_string();
        let user_id = user_id.to_string();
        self.mutate_projects(author, "Remove a project member", move |projects| {
            let doc = projects
                .get_mut(&project_owned)
                .ok_or_else(|| Error::ProjectNotFound(project_owned.clone()))?;
            let before = doc.members.len();
            doc.members.retain(|m| m.user_id != user_id);
            if doc.members.len() == before {
                return Err(Error::MemberNotFound(user_id.clone()));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_member_role(
        &self,
        project: &str,
        user_id: &str,
        role: ProjectRole,
        author: Author,
    ) -> Result<Revision> {
        let project_owned = project.to_string();
        let user_id = user_id.to_string();
        self.mutate_projects(author, "Change a project member's role", move |projects| {
            let doc = projects
                .get_mut(&project_owned)
                .ok_or_else(|| Error::ProjectNotFound(project_owned.clone()))?;
            let member = doc
                .members
                .iter_mut()
                .find(|m| m.user_id == user_id)
                .ok_or_else(|| Error::MemberNotFound(user_id.clone()))?;
            member.role = role;
            Ok(())
        })
        .await
    }

    pub async fn register_repository(
        &self,
        project: &str,
        repo: &Repository,
        author: Author,
    ) -> Result<Revision> {
        let project_owned = project.to_string();
        let repo_name = repo.name.clone();
        let repo_meta = RepositoryMetadata {
            name: repo.name.clone(),
            roles: RepositoryRoles::default(),
            creation: repo.creator.clone(),
            created_at: repo.created_at,
            removal: None,
            status: repo.status,
        };
        self.mutate_projects(author, "Register a repository", move |projects| {
            let doc = projects
                .entry(project_owned.clone())
                .or_insert_with(ProjectMetadataDoc::default);
            if doc.repos.contains_key(&repo_name) {
                return Err(Error::RepositoryExists(repo_name.clone()));
            }
            doc.repos.insert(repo_name.clone(), repo_meta.clone());
            Ok(())
        })
        .await
    }

    /// Soft-deletes a repository's metadata row; the underlying commit log is untouched.
    pub async fn remove_repository(
        &self,
        project: &str,
        repo_name: &str,
        author: Author,
    ) -> Result<Revision> {
        let project_owned = project.to_string();
        let repo_name = repo_name.to_string();
        let author2 = author.clone();
        self.mutate_projects(author, "Remove a repository", move |projects| {
            let doc = projects
                .get_mut(&project_owned)
                .ok_or_else(|| Error::ProjectNotFound(project_owned.clone()))?;
            let repo_meta = doc
                .repos
                .get_mut(&repo_name)
                .ok_or_else(|| Error::RepositoryNotFound(project_owned.clone(), repo_name.clone()))?;
            repo_meta.removal = Some(RemovalMarker {
                by: author2.clone(),
                at: Utc::now(),
            });
            Ok(())
        })
        .await
    }

    /// Grants or overrides a repository-level role for a single user.
    pub async fn set_user_repository_role(
        &self,
        project: &str,
        repo_name: &str,
        user_id: &str,
        role: Role,
        author: Author,
    ) -> Result<Revision> {
        let project_owned = project.to_string();
        let repo_name = repo_name.to_string();
        let user_id = user_id.to_string();
        self.mutate_projects(author, "Grant a repository role", move |projects| {
            let doc = projects
                .get_mut(&project_owned)
                .ok_or_else(|| Error::ProjectNotFound(project_owned.clone()))?;
            let repo_meta = doc
                .repos
                .get_mut(&repo_name)
                .ok_or_else(|| Error::RepositoryNotFound(project_owned.clone(), repo_name.clone()))?;
            repo_meta.roles.users.insert(user_id.clone(), role);
            Ok(())
        })
        .await
    }

    pub async fn create_token(
        &self,
        app_id: &str,
        is_system_admin: bool,
        allow_guest_access: bool,
        creator: Author,
    ) -> Result<(Token, Revision)> {
        let secret = format!("{TOKEN_SECRET_PREFIX}{}", generate_secret());
        let token = Token {
            app_id: app_id.to_string(),
            secret,
            is_system_admin,
            allow_guest_access,
            creation: creator.clone(),
            created_at: Utc::now(),
            deactivation: None,
            deletion: None,
        };
        let to_insert = token.clone();
        let app_id_owned = app_id.to_string();
        let rev = self
            .mutate_tokens(creator, "Create an application token", move |tokens| {
                if tokens.iter().any(|t| t.app_id == app_id_owned) {
                    return Err(Error::InvalidPush(format!(
                        "token {app_id_owned} already exists"
                    )));
                }
                tokens.push(to_insert.clone());
                Ok(())
            })
            .await?;
        Ok((token, rev))
    }

    pub async fn deactivate_token(&self, app_id: &str, author: Author) -> Result<Revision> {
        let app_id = app_id.to_string();
        self.mutate_tokens(author, "Deactivate an application token", move |tokens| {
            let token = tokens
                .iter_mut()
                .find(|t| t.app_id == app_id)
                .ok_or(Error::TokenNotFound)?;
            token.deactivation = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// Soft-deletes a token; it stays in `/tokens.json` (marked deleted) until
    /// [`purge_token`](Self::purge_token) physically removes it.
    pub async fn delete_token(&self, app_id: &str, author: Author) -> Result<Revision> {
        let app_id = app_id.to_string();
        self.mutate_tokens(author, "Delete an application token", move |tokens| {
            let token = tokens
                .iter_mut()
                .find(|t| t.app_id == app_id)
                .ok_or(Error::TokenNotFound)?;
            token.deletion = Some(Utc::now());
            Ok(())
        })
        .await
    }

    pub async fn purge_token(&self, app_id: &str, author: Author) -> Result<Revision> {
        let app_id_owned = app_id.to_string();
        self.mutate_tokens(author, "Purge an application token", move |tokens| {
            let before = tokens.len();
            tokens.retain(|t| !(t.app_id == app_id_owned && t.is_purge_eligible()));
            if tokens.len() == before {
                return Err(Error::TokenNotFound);
            }
            Ok(())
        })
        .await
    }

    pub fn list_tokens(&self) -> Result<Vec<Token>> {
        self.read_all_tokens()
    }

    /// Looks up a token by its secret (the reverse index spec.md §4.7 describes as a
    /// secret→appId map). A purged token is absent from `/tokens.json` entirely, so this
    /// naturally returns `None` for it without a separate index to keep in sync.
    pub fn find_by_secret(&self, secret: &str) -> Result<Option<Token>> {
        Ok(self
            .read_all_tokens()?
            .into_iter()
            .find(|t| t.secret == secret))
    }

    /// Computes the effective role a principal has over `repo_name` within `project`.
    pub fn effective_role(&self, project: &str, principal: &Principal, repo_name: &str) -> Role {
        let doc = match self.get_project_metadata(project) {
            Ok(doc) => doc,
            Err(_) => return Role::None,
        };
        match principal {
            Principal::User(user_id) => effective_user_role(&doc, user_id, repo_name),
            Principal::Token(token) => effective_token_role(&doc, token, repo_name),
        }
    }
}

fn effective_user_role(doc: &ProjectMetadataDoc, user_id: &str, repo_name: &str) -> Role {
    let Some(member) = doc.members.iter().find(|m| m.user_id == user_id) else {
        return Role::None;
    };
    if let Some(role) = member.role.as_repo_role() {
        return role;
    }
    let Some(repo_meta) = doc.repos.get(repo_name) else {
        return Role::None;
    };
    let direct = repo_meta.roles.users.get(user_id).copied().unwrap_or(Role::None);
    let from_project_role = match member.role {
        ProjectRole::Owner => Role::Admin,
        ProjectRole::Member => repo_meta.roles.project_member_role.unwrap_or(Role::None),
        ProjectRole::Guest => repo_meta.roles.project_guest_role.unwrap_or(Role::None),
    };
    direct.max(from_project_role)
}

fn effective_token_role(doc: &ProjectMetadataDoc, token: &Token, repo_name: &str) -> Role {
    if token.is_system_admin {
        return Role::Admin;
    }
    let Some(repo_meta) = doc.repos.get(repo_name) else {
        return Role::None;
    };
    let direct = repo_meta
        .roles
        .tokens
        .get(&token.app_id)
        .copied()
        .unwrap_or(Role::None);
    let from_guest_access = if token.allow_guest_access {
        repo_meta.roles.project_guest_role.unwrap_or(Role::None)
    } else {
        Role::None
    };
    direct.max(from_guest_access)
}

fn generate_secret() -> String {
    (0..32)
        .map(|_| {
            let idx = fastrand::usize(0..62);
            let c = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789"[idx];
            c as char
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server_status::ServerStatus;
    use crate::repository_engine::InMemoryCommitStore;

    fn service() -> MetadataService {
        let dogma = Arc::new(RepositoryEngine::create(
            "dogma",
            "dogma",
            Author::system(),
            Arc::new(InMemoryCommitStore),
            ServerStatus::default(),
        ));
        MetadataService::new(dogma)
    }

    async fn seed_project(svc: &MetadataService, project: &str) {
        svc.mutate_projects(Author::system(), "seed", {
            let project = project.to_string();
            move |projects| {
                projects.entry(project.clone()).or_default();
                Ok(())
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn add_and_remove_member() {
        let svc = service();
        seed_project(&svc, "proj").await;
        svc.add_member("proj", "alice", ProjectRole::Member, Author::system())
            .await
            .unwrap();
        let doc = svc.get_project_metadata("proj").unwrap();
        assert_eq!(doc.members.len(), 1);

        svc.remove_member("proj", "alice", Author::system())
            .await
            .unwrap();
        let doc = svc.get_project_metadata("proj").unwrap();
        assert!(doc.members.is_empty());
    }

    #[tokio::test]
    async fn duplicate_member_rejected() {
        let svc = service();
        seed_project(&svc, "proj").await;
        svc.add_member("proj", "alice", ProjectRole::Member, Author::system())
            .await
            .unwrap();
        let err = svc
            .add_member("proj", "alice", ProjectRole::Member, Author::system())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPush(_)));
    }

    #[tokio::test]
    async fn owner_is_always_admin() {
        let svc = service();
        seed_project(&svc, "proj").await;
        svc.add_member("proj", "alice", ProjectRole::Owner, Author::system())
            .await
            .unwrap();
        let role = svc.effective_role("proj", &Principal::User("alice".to_string()), "main");
        assert_eq!(role, Role::Admin);
    }

    #[tokio::test]
    async fn guest_falls_back_to_project_guest_role() {
        let svc = service();
        seed_project(&svc, "proj").await;
        svc.add_member("proj", "bob", ProjectRole::Guest, Author::system())
            .await
            .unwrap();
        svc.register_repository(
            "proj",
            &Repository {
                name: "main".to_string(),
                creator: Author::system(),
                head_revision: Revision::from(1),
                created_at: Utc::now(),
                status: RepositoryStatus::Active,
                removal: None,
            },
            Author::system(),
        )
        .await
        .unwrap();

        let role = svc.effective_role("proj", &Principal::User("bob".to_string()), "main");
        assert_eq!(role, Role::None);

        svc.mutate_projects(Author::system(), "grant guest role", |projects| {
            projects
                .get_mut("proj")
                .unwrap()
                .repos
                .get_mut("main")
                .unwrap()
                .roles
                .project_guest_role = Some(Role::Read);
            Ok(())
        })
        .await
        .unwrap();

        let role = svc.effective_role("proj", &Principal::User("bob".to_string()), "main");
        assert_eq!(role, Role::Read);
    }

    #[tokio::test]
    async fn effective_role_is_max_of_direct_grant_and_project_role() {
        let svc = service();
        seed_project(&svc, "proj").await;
        svc.add_member("proj", "carol", ProjectRole::Member, Author::system())
            .await
            .unwrap();
        svc.register_repository(
            "proj",
            &Repository {
                name: "main".to_string(),
                creator: Author::system(),
                head_revision: Revision::from(1),
                created_at: Utc::now(),
                status: RepositoryStatus::Active,
                removal: None,
            },
            Author::system(),
        )
        .await
        .unwrap();

        // The project-wide default for members is Admin, but carol was directly granted
        // only Read on this one repository. The effective role must be the max of the
        // two, not the direct grant alone.
        svc.mutate_projects(Author::system(), "set project member default", |projects| {
            projects
                .get_mut("proj")
                .unwrap()
                .repos
                .get_mut("main")
                .unwrap()
                .roles
                .project_member_role = Some(Role::Admin);
            Ok(())
        })
        .await
        .unwrap();
        svc.set_user_repository_role("proj", "main", "carol", Role::Read, Author::system())
            .await
            .unwrap();

        let role = svc.effective_role("proj", &Principal::User("carol".to_string()), "main");
        assert_eq!(role, Role::Admin);

        // Same interaction for tokens: a lower direct grant must not shadow guest access
        // to a higher project-wide default.
        let (token, _) = svc
            .create_token("app1", false, true, Author::system())
            .await
            .unwrap();
        svc.mutate_projects(Author::system(), "set project guest default", |projects| {
            projects
                .get_mut("proj")
                .unwrap()
                .repos
                .get_mut("main")
                .unwrap()
                .roles
                .project_guest_role = Some(Role::Write);
            Ok(())
        })
        .await
        .unwrap();
        svc.mutate_projects(Author::system(), "grant token a lower direct role", |projects| {
            projects
                .get_mut("proj")
                .unwrap()
                .repos
                .get_mut("main")
                .unwrap()
                .roles
                .tokens
                .insert("app1".to_string(), Role::Read);
            Ok(())
        })
        .await
        .unwrap();

        let role = svc.effective_role("proj", &Principal::Token(token), "main");
        assert_eq!(role, Role::Write);
    }

    #[tokio::test]
    async fn system_admin_token_bypasses_everything() {
        let svc = service();
        let (token, _) = svc
            .create_token("my-app", true, false, Author::system())
            .await
            .unwrap();
        let role = svc.effective_role("nonexistent", &Principal::Token(token), "main");
        assert_eq!(role, Role::Admin);
    }

    #[tokio::test]
    async fn token_lifecycle() {
        let svc = service();
        let (token, _) = svc
            .create_token("my-app", false, false, Author::system())
            .await
            .unwrap();
        assert!(token.secret.starts_with(TOKEN_SECRET_PREFIX));

        svc.deactivate_token("my-app", Author::system()).await.unwrap();
        let tokens = svc.list_tokens().unwrap();
        assert!(!tokens[0].is_active());

        svc.delete_token("my-app", Author::system()).await.unwrap();
        let tokens = svc.list_tokens().unwrap();
        assert!(tokens[0].is_purge_eligible());

        svc.purge_token("my-app", Author::system()).await.unwrap();
        assert!(svc.list_tokens().unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_of_active_token_fails() {
        let svc = service();
        svc.create_token("my-app", false, false, Author::system())
            .await
            .unwrap();
        let err = svc.purge_token("my-app", Author::system()).await.unwrap_err();
        assert!(matches!(err, Error::TokenNotFound));
    }
}
