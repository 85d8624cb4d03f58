//! Repository manager
//!
//! Owns the set of live repositories (ordered map under a reader-writer
//! lock), the metadata database, and the checkout-task table. Long-running
//! work (checkout tasks, merge recovery) runs on the shared blocking pool;
//! each job serializes on its repo's operation lock.
//!
//! ## Startup sequence
//!
//! 1. open the metadata DB (tables created if absent)
//! 2. drain `DeletedRepo` tombstones (two-phase delete resumes here)
//! 3. load every `Repo` row: head branch, head commit, snapshot fields;
//!    broken repos are marked corrupted and removed
//! 4. load cached password/keys, regenerating keys from the password when
//!    the key rows were lost
//! 5. load properties (auto-sync, worktree, relay-id, net-browsable,
//!    email, token)
//! 6. register the repo and start its watcher where auto-sync applies
//! 7. resume interrupted merges

use crate::areas::context::EngineContext;
use crate::areas::metadata::MetadataDb;
use crate::areas::repo::{Repo, DEFAULT_BRANCH};
use crate::artifacts::crypt::{CryptKey, CURRENT_ENC_VERSION};
use crate::artifacts::objects::object_id::RepoId;
use crate::error::EngineError;
use anyhow::Context as _;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

pub const PROP_AUTO_SYNC: &str = "auto-sync";
pub const PROP_RELAY_ID: &str = "relay-id";
pub const PROP_NET_BROWSABLE: &str = "net-browsable";
pub const PROP_EMAIL: &str = "email";
pub const PROP_TOKEN: &str = "token";
pub const PROP_WORKTREE: &str = "worktree";
pub const PROP_RELAY_ADDR: &str = "relay-addr";
pub const PROP_RELAY_PORT: &str = "relay-port";

/// Progress record of one asynchronous checkout
#[derive(Debug)]
pub struct CheckoutTask {
    pub repo_id: RepoId,
    pub worktree: PathBuf,
    pub total_files: AtomicI64,
    pub finished_files: AtomicI64,
    pub success: AtomicBool,
}

pub type CheckoutDoneCallback = Box<dyn FnOnce(&CheckoutTask, &Repo) + Send + 'static>;

type CheckoutTaskMap = Arc<Mutex<HashMap<RepoId, Arc<CheckoutTask>>>>;

pub struct RepoManager {
    ctx: Arc<EngineContext>,
    repos: RwLock<BTreeMap<RepoId, Arc<Repo>>>,
    checkout_tasks: CheckoutTaskMap,
}

impl RepoManager {
    /// Manager over `<data_dir>/repo.db`, `<data_dir>/index/`,
    /// `<data_dir>/objects/` with default collaborators
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        let db = Arc::new(MetadataDb::open(&data_dir.join("repo.db"))?);
        Self::with_context(EngineContext::new(data_dir, db))
    }

    /// Manager over a caller-assembled context (custom collaborators)
    pub fn with_context(ctx: EngineContext) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&ctx.index_dir).context("Failed to create index dir")?;

        Ok(RepoManager {
            ctx: Arc::new(ctx),
            repos: RwLock::new(BTreeMap::new()),
            checkout_tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn ctx(&self) -> &EngineContext {
        &self.ctx
    }

    fn repos_read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RepoId, Arc<Repo>>> {
        self.repos.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn repos_write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<RepoId, Arc<Repo>>> {
        self.repos
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- lifecycle ---------------------------------------------------

    /// Drain pending deletions, then load all repos from the DB
    pub fn init(&self) -> anyhow::Result<()> {
        for repo_id in self.ctx.db.list_deleted_repos()? {
            info!(repo = %repo_id, "resuming interrupted deletion");
            self.remove_repo_ondisk(&repo_id)?;
        }

        for repo_id in self.ctx.db.list_repo_ids()? {
            if let Err(err) = self.load_repo(&repo_id) {
                warn!(repo = %repo_id, "failed to load repo: {err:#}");
            }
        }

        Ok(())
    }

    /// Resume interrupted merges and start watchers
    ///
    /// Must run inside a tokio runtime: recovery jobs go to the blocking
    /// pool.
    pub fn start(&self) -> anyhow::Result<()> {
        for repo in self.repos_read().values() {
            let info = self.ctx.db.get_merge_info(repo.id())?;
            if info.in_merge {
                info!(repo = %repo.id(), "resuming interrupted merge");
                let branch = info.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string());
                let repo = repo.clone();
                let ctx = self.ctx.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(err) = repo.merge(&ctx, &branch) {
                        warn!(repo = %repo.id(), "merge recovery failed: {err:#}");
                    }
                });
            }
        }

        for repo in self.repos_read().values() {
            let state = repo.state();
            if state.auto_sync && !state.worktree_invalid {
                self.ctx.monitor.watch_repo(repo.id());
            }
        }

        Ok(())
    }

    // ---- roster ------------------------------------------------------

    pub fn create_new_repo(&self, name: &str, desc: &str) -> anyhow::Result<Arc<Repo>> {
        let repo = Repo::new(RepoId::generate(), name, desc);
        self.add_repo(repo)
    }

    pub fn add_repo(&self, repo: Repo) -> anyhow::Result<Arc<Repo>> {
        self.ctx.db.insert_repo(repo.id())?;

        let repo = Arc::new(repo);
        self.repos_write().insert(repo.id().clone(), repo.clone());

        if repo.check_worktree() {
            if let Some(worktree) = repo.worktree() {
                self.ctx
                    .bus
                    .publish("repo.setwktree", &worktree.root().to_string_lossy());
            }
        }

        Ok(repo)
    }

    /// Live repo by exact id; pending deletions are invisible
    pub fn get_repo(&self, repo_id: &RepoId) -> Option<Arc<Repo>> {
        self.repos_read()
            .get(repo_id)
            .filter(|repo| !repo.state().delete_pending)
            .cloned()
    }

    /// Repo whose id starts with `prefix`, when exactly one matches
    pub fn get_repo_prefix(&self, prefix: &str) -> Option<Arc<Repo>> {
        let repos = self.repos_read();
        let mut matches = repos
            .values()
            .filter(|repo| repo.id().as_str().starts_with(prefix))
            .filter(|repo| !repo.state().delete_pending);

        let first = matches.next()?.clone();
        match matches.next() {
            Some(_) => None, // ambiguous
            None => Some(first),
        }
    }

    pub fn repo_exists(&self, repo_id: &RepoId) -> bool {
        self.get_repo(repo_id).is_some()
    }

    /// Page of live repos in id order
    pub fn get_repo_list(&self, start: usize, limit: usize) -> Vec<Arc<Repo>> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        self.repos_read()
            .values()
            .filter(|repo| !repo.state().delete_pending)
            .skip(start)
            .take(limit)
            .cloned()
            .collect()
    }

    // ---- deletion ----------------------------------------------------

    /// Phase one: tombstone the repo so a crash resumes the delete
    pub fn mark_repo_deleted(&self, repo: &Repo) -> anyhow::Result<()> {
        self.ctx.db.insert_deleted_repo(repo.id())?;
        repo.state_mut().delete_pending = true;

        if let Some(worktree) = repo.worktree() {
            self.ctx
                .bus
                .publish("repo.unsetwktree", &worktree.root().to_string_lossy());
        }

        Ok(())
    }

    /// Phase two: delete every row and the index file, then the tombstone
    fn remove_repo_ondisk(&self, repo_id: &str) -> anyhow::Result<()> {
        // Deleting the Repo row is the commit point; leftovers below it
        // are cleaned up idempotently on the next startup
        self.ctx.db.delete_repo_row(repo_id)?;

        let index_path = self.ctx.index_dir.join(repo_id);
        if let Err(err) = std::fs::remove_file(&index_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(repo = repo_id, "cannot delete index file: {err}");
            }
        }

        for branch_name in self.ctx.db.list_branch_names(repo_id)? {
            self.ctx.db.delete_head_branch(repo_id, &branch_name)?;
            self.ctx.branches.delete(repo_id, &branch_name)?;
        }

        self.ctx.db.delete_properties(repo_id)?;
        self.ctx.db.delete_secrets(repo_id)?;
        self.ctx.db.delete_merge_info(repo_id)?;
        self.ctx.db.delete_tokens(repo_id)?;
        self.ctx.db.delete_deleted_repo(repo_id)?;

        Ok(())
    }

    /// Complete a marked deletion now
    pub fn del_repo(&self, repo: &Repo) -> anyhow::Result<()> {
        self.remove_repo_ondisk(repo.id().as_str())?;
        self.repos_write().remove(repo.id());
        Ok(())
    }

    // ---- properties --------------------------------------------------

    /// Upsert a property, applying side effects of recognized keys
    pub fn set_repo_property(
        &self,
        repo_id: &RepoId,
        key: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let repo = self
            .get_repo(repo_id)
            .ok_or_else(|| EngineError::NotFound(format!("repo {}", repo_id)))?;

        match key {
            PROP_AUTO_SYNC => {
                if value == "true" {
                    repo.state_mut().auto_sync = true;
                    self.ctx.monitor.watch_repo(repo.id());
                } else {
                    repo.state_mut().auto_sync = false;
                    self.ctx.monitor.unwatch_repo(repo.id());
                    // cancel any in-flight sync cooperatively
                    self.ctx.sync_ctl.cancel_sync_task(repo.id());
                }
            }
            PROP_NET_BROWSABLE => {
                repo.state_mut().net_browsable = value == "true";
            }
            PROP_RELAY_ID => return self.set_repo_relay_id(&repo, value),
            PROP_WORKTREE => return self.set_repo_worktree(&repo, Path::new(value)),
            _ => {}
        }

        self.ctx.db.set_property(repo_id.as_str(), key, value)
    }

    pub fn get_repo_property(
        &self,
        repo_id: &RepoId,
        key: &str,
    ) -> anyhow::Result<Option<String>> {
        self.ctx.db.get_property(repo_id.as_str(), key)
    }

    /// Relay ids are 40-char peer ids whose peer carries the MyRelay role
    fn set_repo_relay_id(&self, repo: &Repo, relay_id: &str) -> anyhow::Result<()> {
        if relay_id.len() != 40 {
            return Err(
                EngineError::InvalidInput(format!("bad relay id: {}", relay_id)).into(),
            );
        }
        if !self.ctx.peers.peer_has_role(relay_id, "MyRelay") {
            return Err(EngineError::InvalidInput(format!(
                "peer {} is not a relay",
                relay_id
            ))
            .into());
        }

        self.ctx
            .db
            .set_property(repo.id().as_str(), PROP_RELAY_ID, relay_id)?;
        repo.state_mut().relay_id = Some(relay_id.to_string());
        Ok(())
    }

    /// Install and persist a worktree; the path must exist
    pub fn set_repo_worktree(&self, repo: &Repo, worktree: &Path) -> anyhow::Result<()> {
        install_worktree(&self.ctx, repo, worktree)
    }

    pub fn set_repo_email(&self, repo: &Repo, email: &str) -> anyhow::Result<()> {
        repo.state_mut().email = Some(email.to_string());
        self.ctx
            .db
            .set_property(repo.id().as_str(), PROP_EMAIL, email)
    }

    pub fn set_repo_token(&self, repo: &Repo, token: &str) -> anyhow::Result<()> {
        repo.state_mut().token = Some(token.to_string());
        self.ctx
            .db
            .set_property(repo.id().as_str(), PROP_TOKEN, token)
    }

    pub fn set_repo_relay_info(
        &self,
        repo_id: &RepoId,
        relay_addr: &str,
        relay_port: &str,
    ) -> anyhow::Result<()> {
        self.ctx
            .db
            .set_property(repo_id.as_str(), PROP_RELAY_ADDR, relay_addr)?;
        self.ctx
            .db
            .set_property(repo_id.as_str(), PROP_RELAY_PORT, relay_port)
    }

    pub fn get_repo_relay_info(
        &self,
        repo_id: &RepoId,
    ) -> anyhow::Result<(Option<String>, Option<String>)> {
        Ok((
            self.ctx.db.get_property(repo_id.as_str(), PROP_RELAY_ADDR)?,
            self.ctx.db.get_property(repo_id.as_str(), PROP_RELAY_PORT)?,
        ))
    }

    // ---- encryption --------------------------------------------------

    /// Derive and cache key material from a user-supplied password
    pub fn set_repo_passwd(&self, repo: &Repo, passwd: &str) -> anyhow::Result<()> {
        let enc_version = {
            let state = repo.state();
            if state.encrypted {
                state.enc_version
            } else {
                CURRENT_ENC_VERSION
            }
        };
        let crypt = CryptKey::derive(repo.id(), passwd, enc_version)?;
        let (key_hex, iv_hex) = crypt.to_hex_pair();

        self.ctx.db.set_passwd(repo.id(), passwd)?;
        self.ctx.db.set_keys(repo.id(), &key_hex, &iv_hex)?;

        let mut state = repo.state_mut();
        state.passwd = Some(passwd.to_string());
        state.crypt = Some(crypt);
        state.encrypted = true;
        state.enc_version = enc_version;

        Ok(())
    }

    // ---- checkout tasks ----------------------------------------------

    /// Schedule an asynchronous checkout into a fresh worktree
    ///
    /// On success the worktree is installed on the repo and `done_cb`
    /// fires; the task record lives until then so progress is observable.
    /// Must run inside a tokio runtime.
    pub fn add_checkout_task(
        &self,
        repo: &Arc<Repo>,
        worktree: &Path,
        done_cb: CheckoutDoneCallback,
    ) -> anyhow::Result<()> {
        let task = Arc::new(CheckoutTask {
            repo_id: repo.id().clone(),
            worktree: worktree.to_path_buf(),
            total_files: AtomicI64::new(0),
            finished_files: AtomicI64::new(0),
            success: AtomicBool::new(false),
        });

        self.checkout_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(repo.id().clone(), task.clone());

        let ctx = self.ctx.clone();
        let tasks = self.checkout_tasks.clone();
        let repo = repo.clone();
        tokio::task::spawn_blocking(move || {
            run_checkout_task(&ctx, &tasks, &repo, &task, done_cb);
        });

        Ok(())
    }

    pub fn get_checkout_task(&self, repo_id: &RepoId) -> Option<Arc<CheckoutTask>> {
        self.checkout_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(repo_id)
            .cloned()
    }

    // ---- startup loading ---------------------------------------------

    fn load_repo(&self, repo_id_str: &str) -> anyhow::Result<()> {
        let repo_id = RepoId::try_parse(repo_id_str)
            .map_err(|_| EngineError::InvalidInput(format!("bad repo id {}", repo_id_str)))?;
        let repo = Repo::new(repo_id.clone(), "", "");

        // Head branch, head commit, snapshot fields
        let head_name = self.ctx.db.get_head_branch(&repo_id)?;
        let corrupted = match head_name {
            Some(head_name) => match self.ctx.branches.get(&repo_id, &head_name)? {
                Some(branch) => match self.ctx.store.load_commit(&branch.commit_id) {
                    Ok(commit) => {
                        repo.apply_snapshot(&commit.snapshot);
                        repo.state_mut().head = Some(branch);
                        false
                    }
                    Err(_) => {
                        warn!(repo = repo_id_str, "head commit is missing");
                        true
                    }
                },
                None => {
                    warn!(repo = repo_id_str, "broken head branch name");
                    true
                }
            },
            None => {
                // Just cloned, not checked out yet: snapshot from the
                // default branch if it exists
                match self.ctx.branches.get(&repo_id, DEFAULT_BRANCH)? {
                    Some(branch) => match self.ctx.store.load_commit(&branch.commit_id) {
                        Ok(commit) => {
                            repo.apply_snapshot(&commit.snapshot);
                            false
                        }
                        Err(_) => {
                            warn!(repo = repo_id_str, "default branch commit is missing");
                            true
                        }
                    },
                    None => {
                        warn!(repo = repo_id_str, "no head and no default branch");
                        true
                    }
                }
            }
        };

        if corrupted {
            repo.state_mut().is_corrupted = true;
            self.remove_repo_ondisk(repo_id_str)?;
            return Err(EngineError::Corrupted(format!("repo {}", repo_id_str)).into());
        }

        self.load_repo_secrets(&repo)?;
        self.load_repo_properties(&repo)?;

        self.repos_write().insert(repo_id, Arc::new(repo));
        Ok(())
    }

    fn load_repo_secrets(&self, repo: &Repo) -> anyhow::Result<()> {
        let passwd = self.ctx.db.get_passwd(repo.id())?;
        let keys = self.ctx.db.get_keys(repo.id())?;

        let mut state = repo.state_mut();
        if let Some(passwd) = &passwd {
            state.encrypted = true;
            if state.enc_version == 0 {
                state.enc_version = CURRENT_ENC_VERSION;
            }
            state.passwd = Some(passwd.clone());
        }

        match keys {
            Some((key_hex, iv_hex)) => {
                state.crypt = Some(CryptKey::from_hex_pair(
                    &key_hex,
                    &iv_hex,
                    state.enc_version,
                )?);
            }
            None => {
                // Upgrade path or key-DB loss: regenerate from the cached
                // password
                if let Some(passwd) = passwd {
                    let crypt = CryptKey::derive(repo.id(), &passwd, state.enc_version)?;
                    let (key_hex, iv_hex) = crypt.to_hex_pair();
                    self.ctx.db.set_keys(repo.id(), &key_hex, &iv_hex)?;
                    state.crypt = Some(crypt);
                }
            }
        }

        Ok(())
    }

    fn load_repo_properties(&self, repo: &Repo) -> anyhow::Result<()> {
        let repo_id = repo.id().as_str();
        let db = &self.ctx.db;
        let mut state = repo.state_mut();

        if db.get_property(repo_id, PROP_AUTO_SYNC)?.as_deref() == Some("false") {
            state.auto_sync = false;
        }

        if let Some(worktree) = db.get_property(repo_id, PROP_WORKTREE)? {
            state.worktree = Some(PathBuf::from(worktree));
            state.worktree_invalid = false;
        }

        state.relay_id = db
            .get_property(repo_id, PROP_RELAY_ID)?
            .filter(|relay_id| relay_id.len() == 40);
        state.net_browsable =
            db.get_property(repo_id, PROP_NET_BROWSABLE)?.as_deref() == Some("true");
        state.email = db.get_property(repo_id, PROP_EMAIL)?;
        state.token = db.get_property(repo_id, PROP_TOKEN)?;

        Ok(())
    }
}

/// Shared by `set_repo_worktree` and the checkout job's success path
fn install_worktree(ctx: &EngineContext, repo: &Repo, worktree: &Path) -> anyhow::Result<()> {
    if !worktree.exists() {
        return Err(EngineError::InvalidInput(format!(
            "worktree {} does not exist",
            worktree.display()
        ))
        .into());
    }

    {
        let mut state = repo.state_mut();
        state.worktree = Some(worktree.to_path_buf());
        state.worktree_invalid = false;
    }
    ctx.bus
        .publish("repo.setwktree", &worktree.to_string_lossy());
    ctx.db.set_property(
        repo.id().as_str(),
        PROP_WORKTREE,
        &worktree.to_string_lossy(),
    )?;

    if repo.state().auto_sync {
        ctx.monitor.watch_repo(repo.id());
    }

    Ok(())
}

fn run_checkout_task(
    ctx: &Arc<EngineContext>,
    tasks: &CheckoutTaskMap,
    repo: &Arc<Repo>,
    task: &Arc<CheckoutTask>,
    done_cb: CheckoutDoneCallback,
) {
    match checkout_into(ctx, repo, task) {
        Ok(()) => {
            task.success.store(true, Ordering::Relaxed);
            if let Err(err) = install_worktree(ctx, repo, &task.worktree) {
                warn!(repo = %repo.id(), "failed to persist worktree: {err:#}");
            }
            done_cb(task, repo);
        }
        Err(err) => {
            warn!(repo = %repo.id(), worktree = %task.worktree.display(),
                  "checkout failed: {err:#}");
            task.success.store(false, Ordering::Relaxed);
            done_cb(task, repo);
        }
    }

    tasks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(repo.id());
}

fn checkout_into(ctx: &EngineContext, repo: &Repo, task: &CheckoutTask) -> anyhow::Result<()> {
    std::fs::create_dir_all(&task.worktree)?;
    {
        let mut state = repo.state_mut();
        state.worktree = Some(task.worktree.clone());
        state.worktree_invalid = false;
    }

    let branch = match repo.state().head.clone() {
        Some(head) => head,
        None => ctx.branches.require(repo.id(), DEFAULT_BRANCH)?,
    };
    let commit = ctx.store.load_commit(&branch.commit_id)?;
    task.total_files.store(
        ctx.store.count_tree_files(&commit.root_id)?,
        Ordering::Relaxed,
    );

    repo.checkout(ctx, Some(&task.finished_files))
}
