//! Append-only catalogue store.
//!
//! The catalogue is a JSON-lines file: one normalized row per committed
//! item, unique by `image_id`. The local copy under the save dir is the
//! working truth; it is seeded from the remote at startup, sanitized
//! (invalid lines dropped, rows re-normalized, duplicates removed) via an
//! atomic temp+rename rewrite, flushed to the repository in batches, and
//! periodically re-synced against the remote so other workers' rows are
//! not re-added here.

pub mod row;

pub use row::{normalize, AssetMode, Row, RowPolicy, TextMode};

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::Digest;

use crate::now_ts;
use crate::repo::{CommitOp, RepoGateway};

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub repo_path: String,
    pub save_dir: PathBuf,
    pub upload_enabled: bool,
    pub flush_every: usize,
    pub flush_secs: f64,
    pub refresh_secs: f64,
    pub policy: RowPolicy,
}

struct IndexState {
    indexed: HashSet<String>,
    pending: usize,
    last_flush: f64,
    last_refresh: f64,
    refresh_inflight: bool,
    /// Hex digest of the last remote copy seen, to skip no-op refreshes.
    last_remote_digest: Option<String>,
}

pub struct IndexStore {
    gateway: Arc<RepoGateway>,
    opts: IndexOptions,
    local_path: PathBuf,
    state: Mutex<IndexState>,
}

fn file_digest(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(hex::encode(sha2::Sha256::digest(&bytes)))
}

fn iter_ids_from_jsonl(path: &Path) -> HashSet<String> {
    let mut out = HashSet::new();
    let Ok(file) = std::fs::File::open(path) else {
        return out;
    };
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        let s = line.trim();
        if s.is_empty() {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(s) {
            if let Some(id) = v.get("image_id").and_then(|x| x.as_str()) {
                let id = id.trim();
                if !id.is_empty() {
                    out.insert(id.to_string());
                }
            }
        }
    }
    out
}

impl IndexStore {
    pub fn new(gateway: Arc<RepoGateway>, opts: IndexOptions) -> Self {
        let basename = opts
            .repo_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("train.jsonl");
        let local_path = opts.save_dir.join(basename);
        let _ = std::fs::create_dir_all(&opts.save_dir);

        let store = Self {
            gateway,
            local_path,
            opts,
            state: Mutex::new(IndexState {
                indexed: HashSet::new(),
                pending: 0,
                last_flush: 0.0,
                last_refresh: 0.0,
                refresh_inflight: false,
                last_remote_digest: None,
            }),
        };

        store.init_from_remote();
        let changed = store.sanitize_local();
        {
            let mut st = store.state.lock().unwrap();
            st.indexed = iter_ids_from_jsonl(&store.local_path);
            if changed {
                st.pending = st.pending.max(1);
            }
        }
        if changed {
            store.maybe_flush(true);
        }
        store
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn is_indexed(&self, id: &str) -> bool {
        self.state.lock().unwrap().indexed.contains(id)
    }

    pub fn indexed_len(&self) -> usize {
        self.state.lock().unwrap().indexed.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending
    }

    fn init_from_remote(&self) {
        if self.opts.repo_path.is_empty() {
            return;
        }
        match self.gateway.download(&self.opts.repo_path) {
            Ok(remote) => {
                let digest = file_digest(&remote);
                if std::fs::copy(&remote, &self.local_path).is_ok() {
                    let mut st = self.state.lock().unwrap();
                    st.last_refresh = now_ts();
                    st.last_remote_digest = digest;
                }
                let _ = std::fs::remove_file(&remote);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::debug!("catalogue seed download failed | err={e}"),
        }
    }

    /// Rewrite the local file keeping only valid, normalized, first-seen
    /// rows. Returns whether anything changed.
    fn sanitize_local(&self) -> bool {
        if !self.local_path.exists() {
            return false;
        }
        let Ok(file) = std::fs::File::open(&self.local_path) else {
            return false;
        };
        let dir = self
            .local_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let Ok(mut tmp) = tempfile::NamedTempFile::new_in(&dir) else {
            return false;
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut changed = false;
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            let s = line.trim();
            if s.is_empty() {
                changed = true;
                continue;
            }
            let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(s) else {
                changed = true;
                continue;
            };
            let Some(row) = normalize(&obj, &self.opts.policy) else {
                changed = true;
                continue;
            };
            if !seen.insert(row.image_id.clone()) {
                changed = true;
                continue;
            }
            let out = row.to_line();
            if out != s {
                changed = true;
            }
            if writeln!(tmp, "{out}").is_err() {
                return false;
            }
        }

        if changed {
            if tmp.persist(&self.local_path).is_err() {
                return false;
            }
        }
        changed
    }

    /// Normalize and append one row; duplicates by id are dropped.
    pub fn add_row(&self, raw: &serde_json::Map<String, serde_json::Value>) {
        let Some(row) = normalize(raw, &self.opts.policy) else {
            return;
        };
        {
            let mut st = self.state.lock().unwrap();
            if st.indexed.contains(&row.image_id) {
                return;
            }
            let appended = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.local_path)
                .and_then(|mut f| writeln!(f, "{}", row.to_line()));
            match appended {
                Ok(()) => {
                    st.indexed.insert(row.image_id.clone());
                    st.pending += 1;
                }
                Err(e) => {
                    tracing::warn!("catalogue append failed | id={} | err={e}", row.image_id);
                    return;
                }
            }
        }
        self.maybe_flush(false);
    }

    /// Publish the local catalogue to the repository when thresholds are
    /// met (or `force`). A flush with nothing pending is a no-op.
    pub fn maybe_flush(&self, force: bool) {
        if !self.opts.upload_enabled || self.opts.repo_path.is_empty() {
            return;
        }
        {
            let st = self.state.lock().unwrap();
            if st.pending == 0 {
                return;
            }
            if !force
                && st.pending < self.opts.flush_every
                && (now_ts() - st.last_flush) < self.opts.flush_secs
            {
                return;
            }
        }
        if !self.local_path.is_file() {
            return;
        }
        self.sanitize_local();
        let ops = [CommitOp::PutFile {
            path: self.opts.repo_path.clone(),
            source: self.local_path.clone(),
        }];
        match self.gateway.commit(&ops, "index update") {
            Ok(()) => {
                let mut st = self.state.lock().unwrap();
                st.pending = 0;
                st.last_flush = now_ts();
            }
            Err(e) => {
                tracing::warn!("catalogue flush failed (will retry) | err={e}");
            }
        }
    }

    /// Pull the remote catalogue and union its ids into ours, at most one
    /// refresh in flight and no more often than the refresh interval unless
    /// forced. Returns whether new ids were learned.
    pub fn maybe_refresh(&self, force: bool) -> bool {
        if self.opts.repo_path.is_empty() {
            return false;
        }
        let now = now_ts();
        {
            let mut st = self.state.lock().unwrap();
            if st.refresh_inflight {
                return false;
            }
            if !force && (now - st.last_refresh) < self.opts.refresh_secs {
                return false;
            }
            st.refresh_inflight = true;
        }

        let mut changed = false;
        let remote = self.gateway.download(&self.opts.repo_path);
        match &remote {
            Ok(remote_path) => {
                let digest = file_digest(remote_path);
                let unchanged = {
                    let st = self.state.lock().unwrap();
                    digest.is_some() && digest == st.last_remote_digest
                };
                if !unchanged {
                    let new_ids = iter_ids_from_jsonl(remote_path);
                    let mut st = self.state.lock().unwrap();
                    let before = st.indexed.len();
                    st.indexed.extend(new_ids);
                    changed = st.indexed.len() > before;
                    st.last_remote_digest = digest;
                }
                let _ = std::fs::remove_file(remote_path);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::debug!("catalogue refresh failed | err={e}"),
        }

        let mut st = self.state.lock().unwrap();
        st.last_refresh = now;
        st.refresh_inflight = false;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::mem::MemRepo;
    use crate::repo::{CommitRetryPolicy, ObjectRepo};
    use std::time::Duration;

    fn gateway(repo: &Arc<MemRepo>) -> Arc<RepoGateway> {
        Arc::new(RepoGateway::with_policy(
            Arc::clone(repo) as Arc<dyn ObjectRepo>,
            CommitRetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                throttle_fallback: Duration::from_millis(1),
                ..CommitRetryPolicy::default()
            },
        ))
    }

    fn opts(save_dir: &Path) -> IndexOptions {
        IndexOptions {
            repo_path: "data/train.jsonl".to_string(),
            save_dir: save_dir.to_path_buf(),
            upload_enabled: true,
            flush_every: 2,
            flush_secs: 9_999.0,
            refresh_secs: 9_999.0,
            policy: RowPolicy::default(),
        }
    }

    fn raw_row(id: &str) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_value(serde_json::json!({
            "image_id": id,
            "image_url": format!("https://h/datasets/r/n/resolve/main/u/{id}/{id}.jpg"),
        }))
        .unwrap()
    }

    #[test]
    fn add_row_dedupes_and_flushes_on_threshold() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Arc::new(MemRepo::new());
        let store = IndexStore::new(gateway(&repo), opts(dir.path()));

        store.add_row(&raw_row("a"));
        store.add_row(&raw_row("a"));
        assert_eq!(store.pending(), 1);
        assert!(repo.get("data/train.jsonl").is_none());

        store.add_row(&raw_row("b"));
        // flush_every = 2 reached.
        assert_eq!(store.pending(), 0);
        let remote = String::from_utf8(repo.get("data/train.jsonl").unwrap()).unwrap();
        assert_eq!(remote.lines().count(), 2);
        assert!(store.is_indexed("a"));
        assert!(store.is_indexed("b"));
    }

    #[test]
    fn construction_sanitizes_local_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("train.jsonl");
        std::fs::write(
            &local,
            concat!(
                "{\"image_id\":\"a\",\"tags\":[\"X\",\"x\"]}\n",
                "not json\n",
                "{\"no_id\":true}\n",
                "{\"image_id\":\"a\"}\n",
                "\n",
                "{\"image_id\":\"b\"}\n",
            ),
        )
        .unwrap();
        let repo = Arc::new(MemRepo::new());
        let store = IndexStore::new(gateway(&repo), opts(dir.path()));
        assert_eq!(store.indexed_len(), 2);
        let text = std::fs::read_to_string(&local).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["image_id"], "a");
        assert_eq!(first["tags"], "X");
        // Sanitize changed the file, so the cleaned copy was flushed.
        assert!(repo.get("data/train.jsonl").is_some());
    }

    #[test]
    fn seeds_from_remote_at_construction() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Arc::new(MemRepo::new());
        repo.put("data/train.jsonl", b"{\"image_id\":\"remote1\"}\n");
        let store = IndexStore::new(gateway(&repo), opts(dir.path()));
        assert!(store.is_indexed("remote1"));
        store.add_row(&raw_row("remote1"));
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn refresh_unions_remote_ids() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Arc::new(MemRepo::new());
        let store = IndexStore::new(gateway(&repo), opts(dir.path()));
        assert!(!store.is_indexed("x"));

        // Another worker publishes a row with id X.
        repo.put("data/train.jsonl", b"{\"image_id\":\"x\"}\n");
        assert!(store.maybe_refresh(true));
        assert!(store.is_indexed("x"));

        // A subsequent add_row for X is a no-op.
        store.add_row(&raw_row("x"));
        assert_eq!(store.pending(), 0);

        // Unchanged remote: refresh reports no change.
        assert!(!store.maybe_refresh(true));
    }

    #[test]
    fn unforced_refresh_respects_interval() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Arc::new(MemRepo::new());
        repo.put("data/train.jsonl", b"{\"image_id\":\"seed\"}\n");
        let store = IndexStore::new(gateway(&repo), opts(dir.path()));
        repo.put("data/train.jsonl", b"{\"image_id\":\"later\"}\n");
        // Seeding set last_refresh just now and refresh_secs is huge.
        assert!(!store.maybe_refresh(false));
        assert!(!store.is_indexed("later"));
        assert!(store.maybe_refresh(true));
        assert!(store.is_indexed("later"));
    }

    #[test]
    fn flush_with_nothing_pending_is_a_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Arc::new(MemRepo::new());
        let store = IndexStore::new(gateway(&repo), opts(dir.path()));
        store.maybe_flush(true);
        assert!(repo.get("data/train.jsonl").is_none());
        assert_eq!(repo.commit_count(), 0);
    }
}
