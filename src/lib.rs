//! Repository engine of a file-synchronization client
//!
//! A content-addressed, versioned store that tracks a local working
//! directory against a history of commits, supports encrypted
//! repositories, and merges concurrent changes from a remote peer.
//!
//! The engine exposes operations to stage working-tree changes into an
//! index, commit the index to immutable history, check out any commit
//! into the working tree, reset or revert to a prior commit, and
//! three-way-merge a remote branch. Network transport, peer discovery and
//! the notification bus are interfaces the engine consumes, not things it
//! implements.
//!
//! ## Layout
//!
//! - [`areas`] — the coordinating stores: object store, index, branch
//!   registry, metadata DB, worktree access, the repository itself and
//!   its manager
//! - [`artifacts`] — the domain objects and algorithms: object model,
//!   index format, cache tree, tree walker, diff collectors, merge
//!   primitives, encryption, ignore rules

pub mod areas;
pub mod artifacts;
pub mod error;

pub use areas::context::{
    EngineContext, NotificationBus, PeerRegistry, SyncTaskController, WorktreeMonitor,
};
pub use areas::manager::{CheckoutTask, RepoManager};
pub use areas::metadata::{Branch, MergeInfo, MetadataDb, DEFAULT_REPO_TOKEN};
pub use areas::repo::{index_worktree_files, Repo, DEFAULT_BRANCH};
pub use artifacts::objects::object_id::{ObjectId, RepoId};
pub use error::EngineError;
