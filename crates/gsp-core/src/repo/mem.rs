//! In-memory repository backend.
//!
//! Used by dry runs (`REPO_BACKEND=memory`) and by tests, which also script
//! commit faults through it to exercise the gateway's retry discipline.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{CommitOp, ObjectRepo, RepoError};

#[derive(Default)]
struct MemState {
    files: BTreeMap<String, Vec<u8>>,
    /// Errors returned by upcoming `commit` calls, in order.
    commit_faults: VecDeque<RepoError>,
    /// How many times each path has been written, for assertions on
    /// write-once protocols.
    write_counts: HashMap<String, u64>,
    commits: u64,
    pr_commits: u64,
    squashes: u64,
}

pub struct MemRepo {
    state: Mutex<MemState>,
    tmp: tempfile::TempDir,
    seq: AtomicU64,
}

impl MemRepo {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            tmp: tempfile::TempDir::new().expect("temp dir for MemRepo"),
            seq: AtomicU64::new(0),
        }
    }

    /// Queue an error for a future `commit` call (front of the queue first).
    pub fn inject_commit_fault(&self, err: RepoError) {
        self.state.lock().unwrap().commit_faults.push_back(err);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.files.insert(path.to_string(), bytes.to_vec());
    }

    pub fn commit_count(&self) -> u64 {
        self.state.lock().unwrap().commits
    }

    pub fn pr_commit_count(&self) -> u64 {
        self.state.lock().unwrap().pr_commits
    }

    pub fn squash_count(&self) -> u64 {
        self.state.lock().unwrap().squashes
    }

    pub fn write_count(&self, path: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .write_counts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    fn apply(&self, ops: &[CommitOp], pr: bool) -> Result<(), RepoError> {
        // Materialize payloads before taking the lock so a bad file path
        // fails without mutating anything.
        let mut staged = Vec::with_capacity(ops.len());
        for op in ops {
            staged.push((op.path().to_string(), op.bytes()?));
        }
        let mut st = self.state.lock().unwrap();
        if let Some(err) = st.commit_faults.pop_front() {
            return Err(err);
        }
        for (path, bytes) in staged {
            *st.write_counts.entry(path.clone()).or_insert(0) += 1;
            st.files.insert(path, bytes);
        }
        if pr {
            st.pr_commits += 1;
        } else {
            st.commits += 1;
        }
        Ok(())
    }
}

impl Default for MemRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRepo for MemRepo {
    fn list_files(&self, prefix: &str) -> Result<Vec<String>, RepoError> {
        let st = self.state.lock().unwrap();
        let prefix = prefix.trim_start_matches('/');
        Ok(st
            .files
            .keys()
            .filter(|k| prefix.is_empty() || k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn file_exists(&self, path: &str) -> Result<bool, RepoError> {
        Ok(self.state.lock().unwrap().files.contains_key(path))
    }

    fn download(&self, path: &str) -> Result<PathBuf, RepoError> {
        let bytes = self
            .get(path)
            .ok_or_else(|| RepoError::NotFound(path.to_string()))?;
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "dl-{}-{}",
            n,
            path.rsplit('/').next().unwrap_or("file")
        );
        let local = self.tmp.path().join(name);
        std::fs::write(&local, bytes).map_err(|e| RepoError::Transport(e.to_string()))?;
        Ok(local)
    }

    fn commit(&self, ops: &[CommitOp], _message: &str) -> Result<(), RepoError> {
        self.apply(ops, false)
    }

    fn commit_as_pr(&self, ops: &[CommitOp], _message: &str) -> Result<(), RepoError> {
        self.apply(ops, true)
    }

    fn squash_history(&self, _message: &str) -> Result<(), RepoError> {
        self.state.lock().unwrap().squashes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_atomic_and_listable() {
        let repo = MemRepo::new();
        repo.commit(
            &[
                CommitOp::PutBytes {
                    path: "locks/a".into(),
                    bytes: b"1\nw1\n\n".to_vec(),
                },
                CommitOp::PutBytes {
                    path: "done/a".into(),
                    bytes: Vec::new(),
                },
            ],
            "add a",
        )
        .unwrap();
        assert!(repo.file_exists("locks/a").unwrap());
        assert_eq!(repo.list_files("done/").unwrap(), vec!["done/a".to_string()]);
        assert_eq!(repo.commit_count(), 1);
    }

    #[test]
    fn injected_fault_fails_one_commit_without_side_effects() {
        let repo = MemRepo::new();
        repo.inject_commit_fault(RepoError::PreconditionFailed);
        let op = [CommitOp::PutBytes {
            path: "x".into(),
            bytes: b"v".to_vec(),
        }];
        assert_eq!(
            repo.commit(&op, "m").unwrap_err(),
            RepoError::PreconditionFailed
        );
        assert!(!repo.file_exists("x").unwrap());
        repo.commit(&op, "m").unwrap();
        assert!(repo.file_exists("x").unwrap());
        assert_eq!(repo.write_count("x"), 1);
    }

    #[test]
    fn download_roundtrips_bytes() {
        let repo = MemRepo::new();
        repo.put("data/train.jsonl", b"{\"image_id\":\"a\"}\n");
        let local = repo.download("data/train.jsonl").unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"{\"image_id\":\"a\"}\n");
        assert!(repo.download("missing").unwrap_err().is_not_found());
    }
}
