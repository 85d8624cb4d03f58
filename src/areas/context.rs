//! Engine context
//!
//! Session-wide collaborators are passed into every operation as one
//! explicit context value instead of living behind a global. The context
//! owns the object store, the metadata database, the branch registry and
//! the seams to external collaborators (notification bus, worktree
//! watcher, sync scheduler, peer registry, locked-file probe).
//!
//! The GC gate is the coordination point between staging and the external
//! garbage collector: GC holds the write half for the whole sweep, staging
//! holds the read half while it writes objects.

use crate::areas::branches::BranchRegistry;
use crate::areas::metadata::MetadataDb;
use crate::areas::object_store::ObjectStore;
use crate::artifacts::objects::object_id::RepoId;
use crate::artifacts::unpack::{LockedFileProbe, NoopLockedFileProbe};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Outbound notification bus
///
/// Publishes `repo.setwktree` / `repo.unsetwktree` on worktree validation
/// changes and `repo-committed` after a successful commit.
pub trait NotificationBus: Send + Sync {
    fn publish(&self, kind: &str, payload: &str);
}

/// Worktree filesystem watcher
pub trait WorktreeMonitor: Send + Sync {
    fn watch_repo(&self, repo_id: &RepoId);
    fn unwatch_repo(&self, repo_id: &RepoId);
}

/// In-flight sync task cancellation
pub trait SyncTaskController: Send + Sync {
    fn cancel_sync_task(&self, repo_id: &RepoId);
}

/// Peer roster (CCNet-style); relay ids must belong to a peer carrying the
/// "MyRelay" role
pub trait PeerRegistry: Send + Sync {
    fn peer_has_role(&self, peer_id: &str, role: &str) -> bool;
}

/// Default bus: notifications go to the debug log only
pub struct LogNotificationBus;

impl NotificationBus for LogNotificationBus {
    fn publish(&self, kind: &str, payload: &str) {
        debug!(kind, payload, "notification");
    }
}

pub struct NoopWorktreeMonitor;

impl WorktreeMonitor for NoopWorktreeMonitor {
    fn watch_repo(&self, _repo_id: &RepoId) {}
    fn unwatch_repo(&self, _repo_id: &RepoId) {}
}

pub struct NoopSyncTaskController;

impl SyncTaskController for NoopSyncTaskController {
    fn cancel_sync_task(&self, _repo_id: &RepoId) {}
}

/// Default roster knows no peers, so every relay id is rejected
pub struct EmptyPeerRegistry;

impl PeerRegistry for EmptyPeerRegistry {
    fn peer_has_role(&self, _peer_id: &str, _role: &str) -> bool {
        false
    }
}

/// Everything an engine operation needs, passed explicitly
pub struct EngineContext {
    pub store: ObjectStore,
    pub db: Arc<MetadataDb>,
    pub branches: BranchRegistry,
    /// Directory holding one index file per repo
    pub index_dir: PathBuf,
    pub bus: Arc<dyn NotificationBus>,
    pub monitor: Arc<dyn WorktreeMonitor>,
    pub sync_ctl: Arc<dyn SyncTaskController>,
    pub peers: Arc<dyn PeerRegistry>,
    pub locked_probe: Arc<dyn LockedFileProbe>,
    /// GC exclusion: GC writes, staging reads
    pub gc_gate: RwLock<()>,
    /// Session id recorded as commit creator
    pub session_id: String,
    /// Fallback creator name when a repo has no owner email
    pub session_user: String,
}

impl EngineContext {
    /// Context with default (inert) collaborators
    pub fn new(data_dir: &std::path::Path, db: Arc<MetadataDb>) -> Self {
        EngineContext {
            store: ObjectStore::new(data_dir.join("objects")),
            branches: BranchRegistry::new(db.clone()),
            db,
            index_dir: data_dir.join("index"),
            bus: Arc::new(LogNotificationBus),
            monitor: Arc::new(NoopWorktreeMonitor),
            sync_ctl: Arc::new(NoopSyncTaskController),
            peers: Arc::new(EmptyPeerRegistry),
            locked_probe: Arc::new(NoopLockedFileProbe),
            gc_gate: RwLock::new(()),
            session_id: "local".to_string(),
            session_user: "unknown".to_string(),
        }
    }

    pub fn index_path(&self, repo_id: &RepoId) -> PathBuf {
        self.index_dir.join(repo_id.as_str())
    }

    /// Hold this guard while writing objects; GC takes the other half
    pub fn staging_guard(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.gc_gate
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
