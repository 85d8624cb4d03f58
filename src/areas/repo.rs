//! Repository operations
//!
//! A `Repo` ties the four state domains together: the commit DAG and the
//! object store (via the context), the per-repo index file, and the
//! worktree. Every mutating operation serializes on the repo's operation
//! lock, loads the index, works on it in memory, and either writes the
//! whole result back atomically or drops it, leaving disk state untouched.
//!
//! ## Locking
//!
//! - `op_lock` — at most one mutating operation per repo at a time
//! - `state` — short-lived reader/writer lock over the mutable metadata
//! - the context's GC gate — staging holds the read half while it writes
//!   objects

use crate::areas::context::EngineContext;
use crate::areas::index::{name_has_prefix, IndexState};
use crate::areas::metadata::Branch;
use crate::areas::worktree::Worktree;
use crate::artifacts::cache_tree::cache_tree_update;
use crate::artifacts::crypt::{CryptKey, CURRENT_ENC_VERSION};
use crate::artifacts::diff::{
    collect_changes_index, collect_changes_worktree, collect_untracked, describe_changes,
    resolve_empty_dirs, resolve_renames, DiffEntry,
};
use crate::artifacts::index::cache_entry::{CacheEntry, CacheEntryFlags};
use crate::artifacts::merge::{
    conflict_copy_name, find_best_common_ancestor, merge_file_content, MergedContent,
};
use crate::artifacts::objects::commit::{Commit, RepoSnapshot};
use crate::artifacts::objects::object::Object;
use crate::artifacts::objects::object_id::{ObjectId, RepoId};
use crate::artifacts::unpack::{
    planned_destructive_paths, unpack_trees, update_worktree, ConflictEntry, MergeStrategy,
    UnpackResult,
};
use crate::error::EngineError;
use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::atomic::AtomicI64;
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Branch a repo falls back to when no head is recorded
pub const DEFAULT_BRANCH: &str = "master";

/// Mutable metadata of one repository
#[derive(Debug, Clone, Default)]
pub struct RepoState {
    pub name: String,
    pub desc: String,
    pub head: Option<Branch>,
    pub worktree: Option<PathBuf>,
    pub worktree_invalid: bool,
    pub encrypted: bool,
    pub enc_version: i32,
    pub magic: Option<String>,
    /// Cached in clear once the user supplies it
    pub passwd: Option<String>,
    pub crypt: Option<CryptKey>,
    pub auto_sync: bool,
    pub net_browsable: bool,
    pub relay_id: Option<String>,
    pub email: Option<String>,
    pub token: Option<String>,
    pub is_corrupted: bool,
    pub index_corrupted: bool,
    pub delete_pending: bool,
}

/// One tracked repository
pub struct Repo {
    id: RepoId,
    state: RwLock<RepoState>,
    /// Serializes mutating operations
    op_lock: Mutex<()>,
}

impl Repo {
    pub fn new(id: RepoId, name: &str, desc: &str) -> Self {
        Repo {
            id,
            state: RwLock::new(RepoState {
                name: name.to_string(),
                desc: desc.to_string(),
                worktree_invalid: true,
                auto_sync: true,
                ..Default::default()
            }),
            op_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &RepoId {
        &self.id
    }

    pub fn state(&self) -> std::sync::RwLockReadGuard<'_, RepoState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, RepoState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_op(&self) -> MutexGuard<'_, ()> {
        self.op_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Non-blocking probe used by tests of the at-most-one property
    pub fn try_lock_op(&self) -> Option<MutexGuard<'_, ()>> {
        self.op_lock.try_lock().ok()
    }

    // ---- snapshots ---------------------------------------------------

    /// Populate repo metadata from a commit's snapshot
    pub fn apply_snapshot(&self, snapshot: &RepoSnapshot) {
        let mut state = self.state_mut();
        state.name = snapshot.repo_name.clone();
        state.desc = snapshot.repo_desc.clone();
        state.encrypted = snapshot.is_encrypted();
        if let Some(enc_version) = snapshot.enc_version {
            state.enc_version = enc_version;
            state.magic = snapshot.magic.clone();
        }
    }

    /// Snapshot of repo metadata for a new commit
    pub fn to_snapshot(&self) -> RepoSnapshot {
        let state = self.state();
        RepoSnapshot {
            repo_name: state.name.clone(),
            repo_desc: state.desc.clone(),
            enc_version: state.encrypted.then_some(state.enc_version),
            magic: state.encrypted.then(|| state.magic.clone()).flatten(),
        }
    }

    // ---- encryption --------------------------------------------------

    /// Set the password-verification magic from a candidate password
    pub fn generate_magic(&self, passwd: &str) -> anyhow::Result<()> {
        let crypt = CryptKey::derive(&self.id, passwd, CURRENT_ENC_VERSION)?;
        let mut state = self.state_mut();
        state.encrypted = true;
        state.enc_version = CURRENT_ENC_VERSION;
        state.magic = Some(crypt.magic());
        Ok(())
    }

    /// Recompute the magic from `passwd` and compare
    ///
    /// A mismatch caches nothing; callers must not attempt object reads
    /// after a failure.
    pub fn verify_passwd(&self, passwd: &str) -> anyhow::Result<()> {
        let (enc_version, magic) = {
            let state = self.state();
            (
                state.enc_version,
                state
                    .magic
                    .clone()
                    .ok_or_else(|| EngineError::InvalidInput("repo is not encrypted".into()))?,
            )
        };

        let crypt = CryptKey::derive(&self.id, passwd, enc_version)?;
        if crypt.magic() == magic {
            Ok(())
        } else {
            Err(EngineError::WrongPassword.into())
        }
    }

    fn crypt(&self) -> Option<CryptKey> {
        self.state().crypt.clone()
    }

    // ---- worktree validation -----------------------------------------

    /// Worktree of this repo, if configured and existing on disk
    pub fn worktree(&self) -> Option<Worktree> {
        self.state()
            .worktree
            .as_ref()
            .map(|root| Worktree::new(root.clone()))
    }

    pub fn check_worktree(&self) -> bool {
        self.worktree().map(|wt| wt.is_valid()).unwrap_or(false)
    }

    /// Validate the worktree, flipping watcher/bus state on transitions
    pub fn check_worktree_common(&self, ctx: &EngineContext) -> anyhow::Result<Worktree> {
        let worktree = self.worktree().filter(|wt| wt.is_valid());

        match worktree {
            Some(worktree) => {
                self.validate_worktree(ctx, &worktree);
                Ok(worktree)
            }
            None => {
                self.invalidate_worktree(ctx);
                Err(EngineError::InvalidInput(format!(
                    "repo {} has no valid worktree",
                    self.id
                ))
                .into())
            }
        }
    }

    fn validate_worktree(&self, ctx: &EngineContext, worktree: &Worktree) {
        let mut state = self.state_mut();
        if !state.worktree_invalid {
            return;
        }
        state.worktree_invalid = false;
        let auto_sync = state.auto_sync;
        drop(state);

        if auto_sync {
            ctx.monitor.watch_repo(&self.id);
        }
        ctx.bus
            .publish("repo.setwktree", &worktree.root().to_string_lossy());
    }

    fn invalidate_worktree(&self, ctx: &EngineContext) {
        let mut state = self.state_mut();
        if state.worktree_invalid {
            return;
        }
        state.worktree_invalid = true;
        let auto_sync = state.auto_sync;
        let root = state.worktree.clone();
        drop(state);

        if auto_sync {
            ctx.monitor.unwatch_repo(&self.id);
        }
        if let Some(root) = root {
            ctx.bus
                .publish("repo.unsetwktree", &root.to_string_lossy());
        }
    }

    // ---- head branch -------------------------------------------------

    pub fn set_head(&self, ctx: &EngineContext, branch: Branch) -> anyhow::Result<()> {
        ctx.branches.save_head_mapping(&branch)?;
        self.state_mut().head = Some(branch);
        Ok(())
    }

    fn head_commit(&self, ctx: &EngineContext) -> anyhow::Result<Option<Commit>> {
        let head = self.state().head.clone();
        match head {
            Some(head) => match ctx.store.load_commit(&head.commit_id) {
                Ok(commit) => Ok(Some(commit)),
                Err(err) => {
                    self.state_mut().is_corrupted = true;
                    Err(err.context(format!("head commit of repo {} is missing", self.id)))
                }
            },
            None => Ok(None),
        }
    }

    // ---- staging -----------------------------------------------------

    /// Stage worktree changes under `path_prefix` ("" = whole tree)
    ///
    /// Holds the GC gate's read half for the duration: no new objects are
    /// written while a GC sweep owns the store.
    pub fn index_add(&self, ctx: &EngineContext, path_prefix: &str) -> anyhow::Result<()> {
        let _op = self.lock_op();
        let _staging = ctx.staging_guard();

        let worktree = self.check_worktree_common(ctx)?;
        let mut index = self.load_index(ctx)?;
        let path_prefix = path_prefix.trim_start_matches('/');
        let crypt = self.crypt();

        add_recursive(ctx, &mut index, &worktree, path_prefix, crypt.as_ref(), false)?;
        remove_deleted(&mut index, &worktree, path_prefix)?;

        index.write()
    }

    /// Remove `path_prefix` from the index and the worktree
    ///
    /// Refuses when any affected entry carries local modifications.
    pub fn index_rm(&self, ctx: &EngineContext, path_prefix: &str) -> anyhow::Result<()> {
        let _op = self.lock_op();

        let worktree = self.check_worktree_common(ctx)?;
        let mut index = self.load_index(ctx)?;
        let path_prefix = path_prefix.trim_start_matches('/');

        let victims = index.names_under_prefix(path_prefix);
        check_local_mod(ctx, &index, &worktree, &victims)?;

        for name in &victims {
            index.remove_entry(name);
            worktree.remove_file_and_prune(name)?;
        }

        index.write()
    }

    fn load_index(&self, ctx: &EngineContext) -> anyhow::Result<IndexState> {
        match IndexState::load(&ctx.index_path(&self.id)) {
            Ok(index) => {
                self.state_mut().index_corrupted = false;
                Ok(index)
            }
            Err(err) => {
                warn!(repo = %self.id, "failed to load index: {err:#}");
                self.state_mut().index_corrupted = true;
                Err(err.context(EngineError::Corrupted(format!(
                    "index of repo {}",
                    self.id
                ))))
            }
        }
    }

    // ---- commit ------------------------------------------------------

    /// Commit the index; empty `desc` generates a change summary
    ///
    /// Returns `None` when there is nothing to commit.
    pub fn index_commit(
        &self,
        ctx: &EngineContext,
        desc: &str,
    ) -> anyhow::Result<Option<ObjectId>> {
        let _op = self.lock_op();
        self.index_commit_locked(ctx, desc, None)
    }

    fn index_commit_locked(
        &self,
        ctx: &EngineContext,
        desc: &str,
        merge_second_parent: Option<ObjectId>,
    ) -> anyhow::Result<Option<ObjectId>> {
        self.check_worktree_common(ctx)?;
        let index = self.load_index(ctx)?;

        if index.is_unmerged() {
            return Err(EngineError::Unmerged.into());
        }

        let desc = if desc.is_empty() && merge_second_parent.is_none() {
            match self.gen_commit_description(ctx, &index)? {
                Some(generated) => generated,
                None => return Ok(None), // nothing to commit
            }
        } else {
            desc.to_string()
        };

        let entries: Vec<CacheEntry> = index.entries().cloned().collect();
        let root_id = cache_tree_update(&entries, &mut |tree| ctx.store.store_object(tree))?;

        let (head, creator_name) = {
            let state = self.state();
            (
                state.head.clone(),
                state
                    .email
                    .clone()
                    .unwrap_or_else(|| ctx.session_user.clone()),
            )
        };

        let commit = Commit::new(
            self.id.clone(),
            root_id,
            ctx.session_id.clone(),
            creator_name,
            desc,
            head.as_ref().map(|branch| branch.commit_id.clone()),
            merge_second_parent,
            self.to_snapshot(),
        );
        let commit_id = ctx.store.store_object(&commit)?;

        let branch = match head {
            Some(mut branch) => {
                branch.commit_id = commit_id.clone();
                ctx.branches.update(&branch)?;
                branch
            }
            None => ctx
                .branches
                .create(&self.id, DEFAULT_BRANCH, commit_id.clone())?,
        };
        self.set_head(ctx, branch)?;

        ctx.bus.publish("repo-committed", self.id.as_str());
        info!(repo = %self.id, commit = %commit_id.to_short_oid(), "committed");

        Ok(Some(commit_id))
    }

    fn gen_commit_description(
        &self,
        ctx: &EngineContext,
        index: &IndexState,
    ) -> anyhow::Result<Option<String>> {
        let head_root = self
            .head_commit(ctx)?
            .map(|commit| commit.root_id);
        let mut results = collect_changes_index(index, head_root.as_ref(), &ctx.store)?;
        resolve_empty_dirs(&mut results);
        resolve_renames(&mut results);
        Ok(describe_changes(&results))
    }

    // ---- status ------------------------------------------------------

    /// Classified worktree/index/head differences
    pub fn status(&self, ctx: &EngineContext) -> anyhow::Result<Vec<DiffEntry>> {
        let worktree = self.check_worktree_common(ctx)?;
        let index = self.load_index(ctx)?;

        let mut results = collect_changes_worktree(&index, &worktree, &ctx.store)?;
        results.extend(collect_untracked(&index, &worktree)?);

        let head_root = self.head_commit(ctx)?.map(|commit| commit.root_id);
        results.extend(collect_changes_index(&index, head_root.as_ref(), &ctx.store)?);

        resolve_empty_dirs(&mut results);
        resolve_renames(&mut results);

        Ok(results)
    }

    /// Cheap boolean form of `status` with early exit
    pub fn is_worktree_changed(&self, ctx: &EngineContext) -> anyhow::Result<bool> {
        let worktree = self.check_worktree_common(ctx)?;
        let index = self.load_index(ctx)?;

        if !collect_changes_worktree(&index, &worktree, &ctx.store)?.is_empty() {
            return Ok(true);
        }
        if !collect_untracked(&index, &worktree)?.is_empty() {
            return Ok(true);
        }
        let head_root = self.head_commit(ctx)?.map(|commit| commit.root_id);
        Ok(!collect_changes_index(&index, head_root.as_ref(), &ctx.store)?.is_empty())
    }

    pub fn is_index_unmerged(&self, ctx: &EngineContext) -> anyhow::Result<bool> {
        if self.state().head.is_none() {
            return Ok(false);
        }
        Ok(self.load_index(ctx)?.is_unmerged())
    }

    // ---- history -----------------------------------------------------

    /// Every commit reachable from any branch of this repo
    ///
    /// A traversal failure drops the partial collection and propagates the
    /// error.
    pub fn get_commits(&self, ctx: &EngineContext) -> anyhow::Result<Vec<Commit>> {
        let branches = ctx.branches.list(&self.id)?;
        let mut seen = std::collections::HashSet::new();
        let mut commits = Vec::new();

        for branch in &branches {
            ctx.store.traverse_commits(&branch.commit_id, |commit| {
                if seen.insert(commit.object_id()?) {
                    commits.push(commit.clone());
                }
                Ok(true)
            })?;
        }

        commits.sort_by_key(|commit| std::cmp::Reverse(commit.ctime));
        Ok(commits)
    }

    // ---- checkout ----------------------------------------------------

    /// Two-way checkout of `commit` into the worktree
    ///
    /// Not public: callers go through `checkout`, `reset`, `revert` or
    /// `merge`, which own the operation lock.
    fn checkout_commit(
        &self,
        ctx: &EngineContext,
        commit: &Commit,
        recover_merge: bool,
        finished: Option<&AtomicI64>,
    ) -> anyhow::Result<()> {
        let worktree = self.check_worktree_common(ctx)?;
        let mut index = self.load_index(ctx)?;
        let initial_checkout = index.is_unborn();

        let head_root = if initial_checkout {
            None
        } else {
            let head = self.head_commit(ctx)?.ok_or_else(|| {
                EngineError::Corrupted(format!(
                    "repo {}: index exists but head branch is not set",
                    self.id
                ))
            })?;
            Some(head.root_id)
        };

        let trees = vec![
            ctx.store.flatten_tree(head_root.as_ref())?,
            ctx.store.flatten_tree(Some(&commit.root_id))?,
        ];
        let mut result = unpack_trees(&trees, &index, MergeStrategy::Twoway)?;

        if !result.conflicts.is_empty() {
            return Err(EngineError::Conflict(format!(
                "checkout of {} touches locally modified paths",
                commit.object_id()?.to_short_oid()
            ))
            .into());
        }

        if !initial_checkout
            && !recover_merge
            && ctx
                .locked_probe
                .any_locked(&worktree, &planned_destructive_paths(&result.entries))
        {
            return Err(EngineError::Locked.into());
        }

        update_worktree(
            &mut result,
            &ctx.store,
            &worktree,
            self.crypt().as_ref(),
            finished,
        )?;

        index.replace_entries(result.entries);
        index.write()
    }

    /// Check out the head branch (or the default branch) into the worktree
    ///
    /// Used by checkout tasks on a fresh worktree: any stale index file is
    /// discarded first so the checkout is treated as initial.
    pub fn checkout(
        &self,
        ctx: &EngineContext,
        finished: Option<&AtomicI64>,
    ) -> anyhow::Result<()> {
        let _op = self.lock_op();

        let index_path = ctx.index_path(&self.id);
        if let Err(err) = std::fs::remove_file(&index_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err).context("failed to remove stale index");
            }
        }

        let branch = match self.state().head.clone() {
            Some(head) => head,
            None => ctx.branches.require(&self.id, DEFAULT_BRANCH)?,
        };
        let commit = ctx
            .store
            .load_commit(&branch.commit_id)
            .with_context(|| EngineError::NotFound(format!("commit {}", branch.commit_id)))?;

        if commit.repo_id != self.id {
            return Err(EngineError::Corrupted(format!(
                "commit {} does not belong to repo {}",
                branch.commit_id, self.id
            ))
            .into());
        }

        self.checkout_commit(ctx, &commit, false, finished)?;
        self.set_head(ctx, branch)
    }

    // ---- reset / revert ----------------------------------------------

    /// One-way plan forcing index and worktree to `commit`'s tree
    ///
    /// The commit is borrowed; ownership stays with the caller.
    fn reset_common(
        &self,
        ctx: &EngineContext,
        index: &mut IndexState,
        commit: &Commit,
    ) -> anyhow::Result<()> {
        let worktree = self.check_worktree_common(ctx)?;

        let trees = vec![ctx.store.flatten_tree(Some(&commit.root_id))?];
        let mut result = unpack_trees(&trees, index, MergeStrategy::Oneway)?;

        update_worktree(
            &mut result,
            &ctx.store,
            &worktree,
            self.crypt().as_ref(),
            None,
        )?;

        index.replace_entries(result.entries);
        Ok(())
    }

    /// Reset index, worktree and head to an existing commit
    pub fn reset(&self, ctx: &EngineContext, commit_id: &ObjectId) -> anyhow::Result<()> {
        let _op = self.lock_op();

        self.check_worktree_common(ctx)?;
        let mut index = self.load_index(ctx)?;
        let commit = ctx
            .store
            .load_commit(commit_id)
            .with_context(|| EngineError::NotFound(format!("commit {}", commit_id)))?;

        self.reset_common(ctx, &mut index, &commit)?;
        index.write()?;

        let mut head = self
            .state()
            .head
            .clone()
            .ok_or_else(|| EngineError::Corrupted(format!("repo {} has no head", self.id)))?;
        head.commit_id = commit_id.clone();
        ctx.branches.update(&head)?;
        self.state_mut().head = Some(head);

        Ok(())
    }

    /// Restore an old commit's tree as a new commit on top of head
    pub fn revert(&self, ctx: &EngineContext, commit_id: &ObjectId) -> anyhow::Result<()> {
        let _op = self.lock_op();

        self.check_worktree_common(ctx)?;
        let mut index = self.load_index(ctx)?;
        let commit = ctx
            .store
            .load_commit(commit_id)
            .with_context(|| EngineError::NotFound(format!("commit {}", commit_id)))?;

        self.reset_common(ctx, &mut index, &commit)?;
        index.write()?;

        let when = chrono::DateTime::from_timestamp(commit.ctime, 0)
            .unwrap_or_default()
            .format("%Y-%m-%d %H:%M:%S");
        let desc = format!("Reverted repo to status at {}.", when);

        self.index_commit_locked(ctx, &desc, None)?;
        Ok(())
    }

    // ---- merge -------------------------------------------------------

    /// Merge a remote branch into the head branch
    ///
    /// Returns `true` for a real merge (two-parent commit produced),
    /// `false` for fast-forward and no-op outcomes.
    pub fn merge(&self, ctx: &EngineContext, remote_name: &str) -> anyhow::Result<bool> {
        let _op = self.lock_op();

        let worktree = self.check_worktree_common(ctx)?;
        let remote = ctx.branches.require(&self.id, remote_name)?;

        let head = self
            .state()
            .head
            .clone()
            .ok_or_else(|| EngineError::Corrupted(format!("repo {} has no head", self.id)))?;

        let head_commit = ctx.store.load_commit(&head.commit_id)?;
        let remote_commit = ctx.store.load_commit(&remote.commit_id)?;

        let mut cache = crate::areas::object_store::CommitCache::new();
        cache.load_reachable(&ctx.store, &[&head.commit_id, &remote.commit_id])?;
        let ancestor_id = find_best_common_ancestor(&cache, &head.commit_id, &remote.commit_id)?
            .ok_or_else(|| {
                EngineError::Conflict(format!(
                    "no common ancestor between {} and {}",
                    head.commit_id.to_short_oid(),
                    remote.commit_id.to_short_oid()
                ))
            })?;

        if ancestor_id == remote.commit_id {
            // Also the landing spot when a recovered merge finds its
            // commit already recorded
            ctx.db.clear_merge(&self.id)?;
            debug!(repo = %self.id, "merge is a no-op, remote already merged");
            return Ok(false);
        }

        if ancestor_id == head.commit_id {
            // Fast-forward: recovery state is persisted before the first
            // worktree write and cleared once the branch has moved
            ctx.db.set_merge(&self.id, remote_name)?;
            self.checkout_commit(ctx, &remote_commit, false, None)?;

            let mut head = head;
            head.commit_id = remote.commit_id.clone();
            ctx.branches.update(&head)?;
            self.state_mut().head = Some(head);

            ctx.db.clear_merge(&self.id)?;
            info!(repo = %self.id, "fast-forwarded to {}", remote.commit_id.to_short_oid());
            return Ok(false);
        }

        let ancestor_commit = ctx.store.load_commit(&ancestor_id)?;
        self.real_merge(
            ctx,
            &worktree,
            remote_name,
            &ancestor_commit,
            &head_commit,
            &remote_commit,
        )?;

        Ok(true)
    }

    fn real_merge(
        &self,
        ctx: &EngineContext,
        worktree: &Worktree,
        remote_name: &str,
        ancestor: &Commit,
        ours: &Commit,
        theirs: &Commit,
    ) -> anyhow::Result<()> {
        let mut index = self.load_index(ctx)?;
        let crypt = self.crypt();

        let trees = vec![
            ctx.store.flatten_tree(Some(&ancestor.root_id))?,
            ctx.store.flatten_tree(Some(&ours.root_id))?,
            ctx.store.flatten_tree(Some(&theirs.root_id))?,
        ];
        let mut result = unpack_trees(&trees, &index, MergeStrategy::Threeway)?;

        if ctx
            .locked_probe
            .any_locked(worktree, &planned_destructive_paths(&result.entries))
        {
            return Err(EngineError::Locked.into());
        }

        // Recovery state precedes the first worktree write
        ctx.db.set_merge(&self.id, remote_name)?;

        let conflicts = std::mem::take(&mut result.conflicts);
        update_worktree(&mut result, &ctx.store, worktree, crypt.as_ref(), None)?;

        for conflict in &conflicts {
            self.resolve_conflict(ctx, worktree, crypt.as_ref(), &mut result, conflict)?;
        }

        index.replace_entries(result.entries);
        index.write()?;

        let theirs_id = theirs.object_id()?;
        self.index_commit_locked(ctx, "Auto merge by system", Some(theirs_id))?
            .ok_or_else(|| anyhow::anyhow!("merge produced an empty commit"))?;

        // Only after the merge commit is durable
        ctx.db.clear_merge(&self.id)?;
        Ok(())
    }

    /// Materialize one conflicted path and stage the resolution
    fn resolve_conflict(
        &self,
        ctx: &EngineContext,
        worktree: &Worktree,
        crypt: Option<&CryptKey>,
        result: &mut UnpackResult,
        conflict: &ConflictEntry,
    ) -> anyhow::Result<()> {
        // Staged conflict entries give way to the resolution
        result
            .entries
            .retain(|entry| entry.name != conflict.name || entry.stage == 0);

        let load = |slot: &Option<crate::areas::object_store::TreeSlot>| -> anyhow::Result<Option<Vec<u8>>> {
            match slot {
                Some(slot) if !slot.mode.is_dir() => {
                    let chunks = ctx.store.read_blob_chunks(&slot.oid)?;
                    let mut content = Vec::new();
                    for chunk in chunks {
                        match crypt {
                            Some(crypt) => content.extend_from_slice(&crypt.decrypt(&chunk)?),
                            None => content.extend_from_slice(&chunk),
                        }
                    }
                    Ok(Some(content))
                }
                _ => Ok(None),
            }
        };

        let ancestor = load(&conflict.ancestor)?;
        let ours = load(&conflict.ours)?;
        let theirs = load(&conflict.theirs)?;

        match (ours, theirs) {
            (Some(ours), Some(theirs)) => {
                match merge_file_content(ancestor.as_deref(), &ours, &theirs) {
                    MergedContent::Text { content, conflicted } => {
                        if conflicted {
                            warn!(repo = %self.id, path = %conflict.name, "merge conflict, markers written");
                        }
                        worktree.write_file(&conflict.name, &content)?;
                        self.stage_worktree_file(ctx, worktree, crypt, result, &conflict.name)?;
                    }
                    MergedContent::Binary => {
                        // Keep ours in place; the remote version survives
                        // under a suffixed name
                        let Some(theirs_slot) = &conflict.theirs else {
                            return Err(anyhow::anyhow!(
                                "binary conflict on {} lost its remote side",
                                conflict.name
                            ));
                        };
                        let copy_name = conflict_copy_name(&conflict.name, &theirs_slot.oid);
                        warn!(repo = %self.id, path = %conflict.name, copy = %copy_name, "binary conflict, keeping both versions");

                        worktree.write_file(&conflict.name, &ours)?;
                        worktree.write_file(&copy_name, &theirs)?;
                        self.stage_worktree_file(ctx, worktree, crypt, result, &conflict.name)?;
                        self.stage_worktree_file(ctx, worktree, crypt, result, &copy_name)?;
                    }
                }
            }
            // Modify/delete conflicts keep the surviving side
            (Some(ours), None) => {
                worktree.write_file(&conflict.name, &ours)?;
                self.stage_worktree_file(ctx, worktree, crypt, result, &conflict.name)?;
            }
            (None, Some(theirs)) => {
                worktree.write_file(&conflict.name, &theirs)?;
                self.stage_worktree_file(ctx, worktree, crypt, result, &conflict.name)?;
            }
            (None, None) => {}
        }

        Ok(())
    }

    fn stage_worktree_file(
        &self,
        ctx: &EngineContext,
        worktree: &Worktree,
        crypt: Option<&CryptKey>,
        result: &mut UnpackResult,
        name: &str,
    ) -> anyhow::Result<()> {
        let oid = ctx
            .store
            .index_chunks(&worktree.full_path(name), crypt)?;
        let stat = worktree
            .stat(name)
            .ok_or_else(|| anyhow::anyhow!("just-written file {} is missing", name))?;

        result.entries.retain(|entry| entry.name != name);
        result.entries.push(CacheEntry::new(
            name.to_string(),
            oid,
            crate::artifacts::index::entry_mode::EntryMode::Regular,
            stat.entry_stat(),
        ));
        result.entries.sort();
        Ok(())
    }
}

// ---- free functions used by staging and clone bootstrap ---------------

/// Recursive worktree walk feeding `add_to_index`
///
/// Ignored names are skipped by the directory listing; paths with trailing
/// spaces are skipped entirely. With `ignore_empty_dir = false`, an empty
/// directory leaves a sentinel entry behind.
pub(crate) fn add_recursive(
    ctx: &EngineContext,
    index: &mut IndexState,
    worktree: &Worktree,
    relpath: &str,
    crypt: Option<&CryptKey>,
    ignore_empty_dir: bool,
) -> anyhow::Result<()> {
    if relpath.ends_with(' ') {
        return Ok(()); // unrepresentable on windows peers
    }

    let Some(stat) = worktree.stat(relpath) else {
        warn!(path = relpath, "failed to stat during staging");
        return Ok(());
    };

    if stat.is_file {
        let full_path = worktree.full_path(relpath);
        return index.add_to_index(relpath, stat.entry_stat(), || {
            ctx.store.index_chunks(&full_path, crypt)
        });
    }

    if stat.is_dir {
        let mut child_count = 0;
        for (name, _) in worktree.read_dir_filtered(relpath)? {
            child_count += 1;
            let child = if relpath.is_empty() {
                name
            } else {
                format!("{}/{}", relpath, name)
            };
            add_recursive(ctx, index, worktree, &child, crypt, ignore_empty_dir)?;
        }

        if child_count == 0 && !ignore_empty_dir && !relpath.is_empty() {
            debug!(path = relpath, "adding empty dir sentinel");
            index.add_empty_dir(relpath);
        }
    }

    Ok(())
}

/// Mark entries whose worktree counterpart is gone or changed type, then
/// compact
pub(crate) fn remove_deleted(
    index: &mut IndexState,
    worktree: &Worktree,
    prefix: &str,
) -> anyhow::Result<()> {
    let mut marked = Vec::new();

    for entry in index.entries() {
        if !name_has_prefix(&entry.name, prefix) {
            continue;
        }
        let stat = worktree.stat(&entry.name);

        let gone = if entry.is_empty_dir_sentinel() {
            match stat {
                Some(stat) => !stat.is_dir || !worktree.is_empty_dir(&entry.name)?,
                None => true,
            }
        } else {
            !stat.map(|stat| stat.is_file).unwrap_or(false)
        };

        if gone {
            marked.push((entry.name.clone(), entry.stage));
        }
    }

    for (name, stage) in marked {
        if let Ok(pos) = index.entry_pos(&name, stage) {
            if let Some(entry) = index.entries_mut().nth(pos) {
                entry.flags |= CacheEntryFlags::REMOVE;
            }
        }
    }

    index.remove_marked_entries();
    Ok(())
}

/// Refuse removal when a victim has local modifications
fn check_local_mod(
    ctx: &EngineContext,
    index: &IndexState,
    worktree: &Worktree,
    names: &[String],
) -> anyhow::Result<()> {
    for name in names {
        let Some(entry) = index.entry(name) else {
            continue;
        };
        if entry.is_empty_dir_sentinel() {
            continue;
        }
        let Some(stat) = worktree.stat(name) else {
            continue; // already gone; nothing to lose
        };
        if !stat.is_file {
            continue;
        }
        if entry.stat_match(&stat.entry_stat()) {
            continue;
        }
        let on_disk = ctx.store.compute_blob_id(&worktree.full_path(name))?;
        if on_disk != entry.oid {
            return Err(EngineError::Conflict(format!(
                "'{}' has local modifications",
                name
            ))
            .into());
        }
    }
    Ok(())
}

/// Stage an arbitrary worktree into a repo's index and return the root id
///
/// Used at clone time, before the Repo exists locally. A supplied password
/// discards any stale index first (the user may have entered a wrong
/// password on an earlier attempt). Empty directories are included so
/// fast-forward detection sees them.
pub fn index_worktree_files(
    ctx: &EngineContext,
    repo_id: &RepoId,
    worktree_root: &std::path::Path,
    passwd: Option<&str>,
) -> anyhow::Result<ObjectId> {
    let index_path = ctx.index_path(repo_id);

    if passwd.is_some() {
        if let Err(err) = std::fs::remove_file(&index_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err).context("failed to discard stale index");
            }
        }
    }

    let crypt = passwd
        .map(|passwd| CryptKey::derive(repo_id, passwd, CURRENT_ENC_VERSION))
        .transpose()?;

    let worktree = Worktree::new(worktree_root.to_path_buf());
    let mut index = IndexState::load(&index_path)?;

    add_recursive(ctx, &mut index, &worktree, "", crypt.as_ref(), false)?;
    remove_deleted(&mut index, &worktree, "")?;

    let entries: Vec<CacheEntry> = index.entries().cloned().collect();
    let root_id = cache_tree_update(&entries, &mut |tree| ctx.store.store_object(tree))?;

    index.write()?;
    Ok(root_id)
}
