//! Per-item claim-and-done store.
//!
//! Two tiny files per item in the shared repository give every id
//! at-most-one active worker: `locks/<id>` is a lease (newline record of
//! timestamp, owner, extra), `done/<id>` is an empty terminal marker.
//! Lease writes never read-modify-write; a lost race is settled by
//! whichever commit lands first, and the loser's next lease read returns
//! `LockedByOther`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::now_ts;
use crate::repo::RepoGateway;

pub const LOCKS_DIR: &str = "locks";
pub const DONE_DIR: &str = "done";

/// Hold applied after an indeterminate claim-store error.
const ERROR_HOLD_SECS: f64 = 30.0;

/// Outcome of a lock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockStatus {
    /// We hold the lease until roughly the given wall-clock time.
    Acquired { until: f64 },
    /// Someone else holds an unexpired lease; skip until it stales.
    LockedByOther { until: f64 },
    /// The item is terminally complete.
    Done,
    /// Indeterminate failure; retry no earlier than `retry_at`.
    Error { retry_at: f64 },
}

/// Parsed lease file.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub ts: f64,
    pub owner: String,
    pub extra: Option<String>,
}

/// Decode `ts\nowner\nextra\n`. A lease with an unparseable timestamp is
/// treated as absent so a corrupt write cannot wedge an id forever.
pub fn parse_lease(bytes: &[u8]) -> Option<Lease> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines().map(str::trim);
    let ts: f64 = lines.next()?.parse().ok()?;
    let owner = lines.next().unwrap_or("").to_string();
    let extra = lines
        .next()
        .map(str::to_string)
        .filter(|s| !s.is_empty());
    Some(Lease { ts, owner, extra })
}

pub fn encode_lease(ts: f64, owner: &str, extra: Option<&str>) -> Vec<u8> {
    format!("{}\n{}\n{}\n", ts, owner, extra.unwrap_or("")).into_bytes()
}

pub struct ItemClaims {
    gateway: Arc<RepoGateway>,
    owner_id: String,
    stale_secs: f64,
    done: Mutex<HashSet<String>>,
}

impl ItemClaims {
    /// Seed the done set from a `done/` listing so the common case (already
    /// processed) never touches the repository again.
    pub fn new(gateway: Arc<RepoGateway>, owner_id: &str, stale_secs: f64) -> Self {
        let done = match gateway.list_files(&format!("{DONE_DIR}/")) {
            Ok(paths) => paths
                .into_iter()
                .filter_map(|p| {
                    p.strip_prefix(&format!("{DONE_DIR}/"))
                        .map(|s| s.trim_matches('/').to_string())
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Err(e) => {
                tracing::warn!("done listing failed, starting empty | err={e}");
                HashSet::new()
            }
        };
        tracing::debug!("claim store seeded with {} done ids", done.len());
        Self {
            gateway,
            owner_id: owner_id.to_string(),
            stale_secs,
            done: Mutex::new(done),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn lock_path(id: &str) -> String {
        format!("{LOCKS_DIR}/{id}")
    }

    pub fn done_path(id: &str) -> String {
        format!("{DONE_DIR}/{id}")
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.done.lock().unwrap().contains(id)
    }

    /// Record an id as done locally (e.g. learned from an existence probe).
    pub fn note_done(&self, id: &str) {
        self.done.lock().unwrap().insert(id.to_string());
    }

    /// Lease read: `Ok(None)` means no lease file, `Err(())` means an
    /// indeterminate failure the caller must back off from.
    fn read_lease(&self, id: &str) -> Result<Option<Lease>, ()> {
        match self.gateway.download(&Self::lock_path(id)) {
            Ok(local) => {
                let bytes = std::fs::read(&local).map_err(|_| ())?;
                let _ = std::fs::remove_file(&local);
                Ok(parse_lease(&bytes))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                tracing::debug!("lease read failed | id={id} | err={e}");
                Err(())
            }
        }
    }

    /// Try to take the item lease. `extra` is free-form context recorded in
    /// the lease (the discover stage stores the global offset).
    pub fn try_lock(&self, id: &str, extra: Option<&str>) -> LockStatus {
        let now = now_ts();
        if id.is_empty() {
            return LockStatus::Error {
                retry_at: now + ERROR_HOLD_SECS,
            };
        }
        if self.is_done(id) {
            return LockStatus::Done;
        }

        match self.read_lease(id) {
            Err(()) => {
                return LockStatus::Error {
                    retry_at: now + ERROR_HOLD_SECS,
                }
            }
            Ok(Some(lease)) => {
                if now - lease.ts < self.stale_secs {
                    return LockStatus::LockedByOther {
                        until: lease.ts + self.stale_secs,
                    };
                }
                // Stale lease: fall through and overwrite it.
            }
            Ok(None) => {}
        }

        let ops = [crate::repo::CommitOp::PutBytes {
            path: Self::lock_path(id),
            bytes: encode_lease(now, &self.owner_id, extra),
        }];
        match self.gateway.commit(&ops, &format!("lock {id}")) {
            Ok(()) => LockStatus::Acquired {
                until: now + self.stale_secs,
            },
            Err(e) => {
                tracing::debug!("lease write failed | id={id} | err={e}");
                LockStatus::Error {
                    retry_at: now + ERROR_HOLD_SECS,
                }
            }
        }
    }

    /// Write the terminal marker. Idempotent: re-marking a done id rewrites
    /// the same empty file and still reports success.
    pub fn mark_done(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let ops = [crate::repo::CommitOp::PutBytes {
            path: Self::done_path(id),
            bytes: Vec::new(),
        }];
        match self.gateway.commit(&ops, &format!("done {id}")) {
            Ok(()) => {
                self.note_done(id);
                true
            }
            Err(e) => {
                tracing::warn!("done write failed | id={id} | err={e}");
                false
            }
        }
    }
}
