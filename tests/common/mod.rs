//! Shared fixtures for the end-to-end scenarios
//!
//! Each test gets a throwaway data directory (metadata DB, index files,
//! object store) plus a worktree, wired through a `RepoManager` with the
//! default inert collaborators.

use assert_fs::prelude::*;
use std::sync::Arc;
use synclave::areas::repo::Repo;
use synclave::{ObjectId, RepoManager};

pub struct TestBed {
    pub data_dir: assert_fs::TempDir,
    pub worktree: assert_fs::TempDir,
    pub manager: Arc<RepoManager>,
    pub repo: Arc<Repo>,
}

/// Fresh manager + repo with an attached worktree
pub fn bed() -> TestBed {
    let data_dir = assert_fs::TempDir::new().unwrap();
    let worktree = assert_fs::TempDir::new().unwrap();

    let manager = Arc::new(RepoManager::new(data_dir.path()).unwrap());
    let repo = manager.create_new_repo("test-repo", "scenario repo").unwrap();
    manager.set_repo_worktree(&repo, worktree.path()).unwrap();

    TestBed {
        data_dir,
        worktree,
        manager,
        repo,
    }
}

impl TestBed {
    pub fn write_file(&self, relpath: &str, content: &str) {
        self.worktree.child(relpath).write_str(content).unwrap();
    }

    pub fn make_dir(&self, relpath: &str) {
        self.worktree.child(relpath).create_dir_all().unwrap();
    }

    pub fn remove_file(&self, relpath: &str) {
        std::fs::remove_file(self.worktree.child(relpath).path()).unwrap();
    }

    /// Stage everything and commit, returning the new commit id
    pub fn stage_and_commit(&self, desc: &str) -> ObjectId {
        self.repo.index_add(self.manager.ctx(), "").unwrap();
        self.repo
            .index_commit(self.manager.ctx(), desc)
            .unwrap()
            .expect("expected a commit to be produced")
    }

    pub fn head_commit_id(&self) -> ObjectId {
        self.repo.state().head.clone().unwrap().commit_id
    }

    pub fn load_commit(&self, commit_id: &ObjectId) -> synclave::artifacts::objects::commit::Commit {
        self.manager.ctx().store.load_commit(commit_id).unwrap()
    }

    /// Names of the head tree's root-level entries, in canonical order
    pub fn head_root_entries(&self) -> Vec<String> {
        let head = self.load_commit(&self.head_commit_id());
        let tree = self.manager.ctx().store.load_tree(&head.root_id).unwrap();
        tree.entries().map(|(name, _)| name.clone()).collect()
    }

    pub fn index_file_bytes(&self) -> Vec<u8> {
        std::fs::read(self.manager.ctx().index_path(self.repo.id())).unwrap()
    }
}
