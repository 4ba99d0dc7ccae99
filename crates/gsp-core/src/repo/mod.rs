//! Shared versioned object repository.
//!
//! All cross-worker coordination state (item leases, range leases, done
//! markers, the catalogue, the sample files themselves) lives in one shared
//! repository. The pipeline only ever sees the [`ObjectRepo`] trait; the
//! [`gateway::RepoGateway`] layers retry, rate-limit and caching policy on
//! top of whichever backend is configured.

mod error;
pub mod gateway;
pub mod hub;
pub mod mem;

pub use error::RepoError;
pub use gateway::{CommitRetryPolicy, RepoGateway};

use std::path::PathBuf;

/// One atomic `put` inside a commit.
#[derive(Debug, Clone)]
pub enum CommitOp {
    PutBytes { path: String, bytes: Vec<u8> },
    PutFile { path: String, source: PathBuf },
}

impl CommitOp {
    pub fn path(&self) -> &str {
        match self {
            CommitOp::PutBytes { path, .. } => path,
            CommitOp::PutFile { path, .. } => path,
        }
    }

    /// Materialize the payload (reads the file for `PutFile`).
    pub fn bytes(&self) -> Result<Vec<u8>, RepoError> {
        match self {
            CommitOp::PutBytes { bytes, .. } => Ok(bytes.clone()),
            CommitOp::PutFile { source, .. } => std::fs::read(source)
                .map_err(|e| RepoError::Transport(format!("read {}: {}", source.display(), e))),
        }
    }
}

/// The shared repository as the worker consumes it. Implementations must be
/// safe to call from multiple stage threads at once.
pub trait ObjectRepo: Send + Sync {
    /// All file paths under `prefix` (no leading slash, `/`-separated).
    /// A missing prefix is an empty listing, not an error.
    fn list_files(&self, prefix: &str) -> Result<Vec<String>, RepoError>;

    /// Uncached existence check.
    fn file_exists(&self, path: &str) -> Result<bool, RepoError>;

    /// Fetch a file into a local temp path owned by the caller.
    /// Missing files are `RepoError::NotFound`.
    fn download(&self, path: &str) -> Result<PathBuf, RepoError>;

    /// Apply all ops atomically against the current head revision.
    fn commit(&self, ops: &[CommitOp], message: &str) -> Result<(), RepoError>;

    /// Same ops routed through a pull request; used when the server refuses
    /// direct commits.
    fn commit_as_pr(&self, ops: &[CommitOp], message: &str) -> Result<(), RepoError>;

    /// Optional history compaction. Backends without the concept no-op.
    fn squash_history(&self, _message: &str) -> Result<(), RepoError> {
        Ok(())
    }
}
