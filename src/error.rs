//! Error types for the memory store.
//!
//! Every fallible library operation returns [`Result`]. The variants fall
//! into three groups:
//!
//! - **Expected failures** callers are allowed to recover from: a missing
//!   path, an unresolvable ref, a clean working tree at commit time. The
//!   scope-routing read fallback and the auto-commit tail of every mutation
//!   depend on being able to distinguish these without string matching.
//! - **Invariant violations**: writing a `read-only` file, pinning a file
//!   that is already pinned.
//! - **External errors** wrapped from dependencies (`sqlx`, I/O, JSON).
//!
//! Git stderr is classified into these variants by `git::classify_git_error`;
//! no caller ever inspects raw git output.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested path does not exist in the selected store at the
    /// selected ref.
    #[error("not found: {0}")]
    NotFound(String),

    /// A ref name could not be resolved (unknown revision, bad object,
    /// ambiguous argument).
    #[error("ref lookup failed: {0}")]
    RefLookup(String),

    /// The target file's frontmatter carries `read-only: true`.
    #[error("file is read-only: {0}")]
    ReadOnly(String),

    /// Pin target already lives under `system/`.
    #[error("already pinned: {0}")]
    AlreadyPinned(String),

    /// Unpin target is not under `system/`.
    #[error("not pinned: {0}")]
    NotPinned(String),

    /// A commit was requested but the working tree is clean. Callers MUST
    /// treat this as success.
    #[error("no changes to commit")]
    NoChanges,

    /// The store lock could not be acquired within the deadline.
    #[error("store is busy: lock at {path} held by pid {held_by}")]
    Busy { path: String, held_by: u32 },

    /// Missing required parameter or malformed value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A git subprocess failed for a reason outside the taxonomy above.
    #[error("git: {0}")]
    Git(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else (subprocess failure, malformed internal state).
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// True for the commit-time "working tree clean" outcome, which every
    /// mutation treats as success.
    pub fn is_no_changes(&self) -> bool {
        matches!(self, Error::NoChanges)
    }

    /// True when a read against one store may fall back to the next
    /// candidate store (ordered read fallback in the scope resolver).
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::RefLookup(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_changes_is_recoverable() {
        assert!(Error::NoChanges.is_no_changes());
        assert!(!Error::NotFound("x.md".into()).is_no_changes());
    }

    #[test]
    fn test_fallback_eligibility() {
        assert!(Error::NotFound("a.md".into()).is_fallback_eligible());
        assert!(Error::RefLookup("refs/nope".into()).is_fallback_eligible());
        assert!(!Error::ReadOnly("a.md".into()).is_fallback_eligible());
        assert!(!Error::Internal("boom".into()).is_fallback_eligible());
    }

    #[test]
    fn test_display_messages() {
        let e = Error::Busy {
            path: "/tmp/s/.git/.hivemind-memory.lock".into(),
            held_by: 42,
        };
        assert!(e.to_string().contains("pid 42"));
        assert!(Error::NoChanges.to_string().contains("no changes"));
    }
}
