//! Engine error taxonomy
//!
//! Internal helpers propagate `anyhow::Result` and attach context strings.
//! Failures that callers must be able to classify (wrong password, unmerged
//! index, missing objects, ...) are constructed as `EngineError` values and
//! travel inside the `anyhow::Error`; callers downcast with
//! `err.downcast_ref::<EngineError>()` when they need the code.

use thiserror::Error;

/// Classified engine failures
///
/// These are the only error codes that escape the repository engine.
/// I/O and database failures are wrapped with context at the operation
/// boundary and carry no code of their own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Invalid repo id, bad prefix, nonexistent worktree, bad relay id
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing commit, branch, or repo
    #[error("{0} not found")]
    NotFound(String),

    /// Index unparseable, head commit missing, tree referenced but absent
    #[error("repository data corrupted: {0}")]
    Corrupted(String),

    /// Unmerged index blocks commit; locked files abort checkout
    #[error("conflict: {0}")]
    Conflict(String),

    /// Magic mismatch on password verification
    #[error("wrong password")]
    WrongPassword,

    /// The index contains entries left by an unresolved three-way merge
    #[error("index has unmerged entries")]
    Unmerged,

    /// Planned worktree changes touch files held open by another process
    #[error("files are locked by another process")]
    Locked,
}

impl EngineError {
    /// True when the error means "the thing does not exist" as opposed to
    /// "something went wrong while looking".
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}
