//! Branch registry
//!
//! Branches are named mutable pointers from `(repo_id, name)` to a commit
//! id, persisted in the metadata database. Updates are atomic row swaps:
//! readers observe either the old or the new commit id, never a torn value.
//!
//! The registry also maintains the `RepoBranch` head cache: the name of
//! each repo's head branch, refreshed on every `set_head`.

use crate::areas::metadata::{Branch, MetadataDb};
use crate::artifacts::objects::object_id::{ObjectId, RepoId};
use crate::error::EngineError;
use std::sync::Arc;

#[derive(Clone)]
pub struct BranchRegistry {
    db: Arc<MetadataDb>,
}

impl BranchRegistry {
    pub fn new(db: Arc<MetadataDb>) -> Self {
        BranchRegistry { db }
    }

    pub fn create(
        &self,
        repo_id: &RepoId,
        name: &str,
        commit_id: ObjectId,
    ) -> anyhow::Result<Branch> {
        let branch = Branch {
            repo_id: repo_id.clone(),
            name: name.to_string(),
            commit_id,
        };
        self.db.upsert_branch(&branch)?;
        Ok(branch)
    }

    pub fn get(&self, repo_id: &RepoId, name: &str) -> anyhow::Result<Option<Branch>> {
        self.db.get_branch(repo_id, name)
    }

    /// Like `get`, but a missing branch is an error with a code
    pub fn require(&self, repo_id: &RepoId, name: &str) -> anyhow::Result<Branch> {
        self.get(repo_id, name)?.ok_or_else(|| {
            EngineError::NotFound(format!("branch {} of repo {}", name, repo_id)).into()
        })
    }

    pub fn list(&self, repo_id: &RepoId) -> anyhow::Result<Vec<Branch>> {
        self.db.list_branches(repo_id)
    }

    /// Atomically swap the branch's commit id
    pub fn update(&self, branch: &Branch) -> anyhow::Result<()> {
        self.db.upsert_branch(branch)
    }

    pub fn delete(&self, repo_id: &str, name: &str) -> anyhow::Result<()> {
        self.db.delete_branch(repo_id, name)
    }

    /// Record `branch` as its repo's head branch
    pub fn save_head_mapping(&self, branch: &Branch) -> anyhow::Result<()> {
        self.db.set_head_branch(&branch.repo_id, &branch.name)
    }

    pub fn unmap_head(&self, repo_id: &str, branch_name: &str) -> anyhow::Result<()> {
        self.db.delete_head_branch(repo_id, branch_name)
    }
}
