//! Per-range claim store and done-prefix bookkeeping.
//!
//! Ranges are half-open windows of the upstream offset space, named
//! `<start>-<end>` with an inclusive end. A range lease works like an item
//! lease (blind write, stale takeover); done markers are permanent; an
//! abandonment record documents why a holder walked away without releasing
//! (the lease simply stales out). A JSON progress snapshot rides along so
//! the next holder can resume mid-range.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::claims::{encode_lease, parse_lease};
use crate::now_ts;
use crate::progress::ProgressSnapshot;
use crate::repo::{CommitOp, RepoGateway};

pub const RANGE_LOCKS_DIR: &str = "ranges/locks";
pub const RANGE_DONE_DIR: &str = "ranges/done";
pub const RANGE_PROGRESS_DIR: &str = "ranges/progress";
pub const RANGE_ABANDONED_DIR: &str = "ranges/abandoned";

/// Minimum spacing between heartbeat commits.
const HEARTBEAT_MIN_INTERVAL_SECS: f64 = 1.0;

/// Parse `"<a>-<b>"` with `a <= b`; anything else is not a range name.
pub fn parse_range_name(name: &str) -> Option<(u64, u64)> {
    let (a, b) = name.trim().split_once('-')?;
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if !a.bytes().all(|c| c.is_ascii_digit()) || !b.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let a: u64 = a.parse().ok()?;
    let b: u64 = b.parse().ok()?;
    if b < a {
        return None;
    }
    Some((a, b))
}

pub fn range_name(a: u64, b: u64) -> String {
    format!("{a}-{b}")
}

/// Largest `expected` such that the sorted done ranges tile `[0, expected)`
/// without a gap.
pub fn compute_done_prefix(done: &BTreeSet<(u64, u64)>) -> u64 {
    let mut expected = 0u64;
    for &(a, b) in done {
        if a != expected {
            break;
        }
        expected = b + 1;
    }
    expected
}

struct RangeState {
    done: BTreeSet<(u64, u64)>,
    done_prefix: u64,
    last_heartbeat: f64,
}

pub struct RangeClaims {
    gateway: Arc<RepoGateway>,
    owner_id: String,
    stale_secs: f64,
    state: Mutex<RangeState>,
}

impl RangeClaims {
    pub fn new(gateway: Arc<RepoGateway>, owner_id: &str, stale_secs: f64) -> Self {
        let done = Self::list_done(&gateway);
        let done_prefix = compute_done_prefix(&done);
        Self {
            gateway,
            owner_id: owner_id.to_string(),
            stale_secs,
            state: Mutex::new(RangeState {
                done,
                done_prefix,
                last_heartbeat: 0.0,
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn list_done(gateway: &RepoGateway) -> BTreeSet<(u64, u64)> {
        let prefix = format!("{RANGE_DONE_DIR}/");
        match gateway.list_files(&prefix) {
            Ok(paths) => paths
                .iter()
                .filter_map(|p| p.strip_prefix(&prefix))
                .filter_map(|name| parse_range_name(name.trim_matches('/')))
                .collect(),
            Err(e) => {
                tracing::warn!("range done listing failed | err={e}");
                BTreeSet::new()
            }
        }
    }

    fn lock_path(a: u64, b: u64) -> String {
        format!("{RANGE_LOCKS_DIR}/{}", range_name(a, b))
    }

    fn done_path(a: u64, b: u64) -> String {
        format!("{RANGE_DONE_DIR}/{}", range_name(a, b))
    }

    fn progress_path(a: u64, b: u64) -> String {
        format!("{RANGE_PROGRESS_DIR}/{}", range_name(a, b))
    }

    fn abandoned_path(a: u64, b: u64) -> String {
        format!("{RANGE_ABANDONED_DIR}/{}", range_name(a, b))
    }

    pub fn done_prefix(&self) -> u64 {
        self.state.lock().unwrap().done_prefix
    }

    /// Re-list `ranges/done/` and recompute the contiguous prefix.
    pub fn refresh_done_prefix(&self) -> u64 {
        let done = Self::list_done(&self.gateway);
        let mut st = self.state.lock().unwrap();
        st.done = done;
        st.done_prefix = compute_done_prefix(&st.done);
        st.done_prefix
    }

    /// Attempt to take the lease for `[a, b]`. Fails on a done range, on an
    /// unexpired foreign lease, or on a commit error.
    pub fn try_lock_range(&self, a: u64, b: u64) -> bool {
        if b < a {
            return false;
        }
        {
            let st = self.state.lock().unwrap();
            if st.done.contains(&(a, b)) {
                return false;
            }
        }

        let now = now_ts();
        match self.gateway.download(&Self::lock_path(a, b)) {
            Ok(local) => {
                let bytes = std::fs::read(&local).unwrap_or_default();
                let _ = std::fs::remove_file(&local);
                if let Some(lease) = parse_lease(&bytes) {
                    if now - lease.ts < self.stale_secs {
                        return false;
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::debug!("range lease read failed | range={a}-{b} | err={e}");
                return false;
            }
        }

        let ops = [CommitOp::PutBytes {
            path: Self::lock_path(a, b),
            bytes: encode_lease(now, &self.owner_id, None),
        }];
        match self.gateway.commit(&ops, &format!("range lock {a}-{b}")) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("range lease write failed | range={a}-{b} | err={e}");
                false
            }
        }
    }

    pub fn mark_done_range(&self, a: u64, b: u64) -> bool {
        let ops = [CommitOp::PutBytes {
            path: Self::done_path(a, b),
            bytes: Vec::new(),
        }];
        match self.gateway.commit(&ops, &format!("range done {a}-{b}")) {
            Ok(()) => {
                let mut st = self.state.lock().unwrap();
                st.done.insert((a, b));
                st.done_prefix = compute_done_prefix(&st.done);
                true
            }
            Err(e) => {
                tracing::warn!("range done write failed | range={a}-{b} | err={e}");
                false
            }
        }
    }

    /// Record why the range was walked away from. The lease is left in
    /// place; the range becomes claimable again once it stales.
    pub fn mark_abandoned_range(&self, a: u64, b: u64, reason: &str) -> bool {
        let record = serde_json::json!({
            "ts": now_ts(),
            "owner": self.owner_id,
            "reason": reason,
        });
        let ops = [CommitOp::PutBytes {
            path: Self::abandoned_path(a, b),
            bytes: format!("{record}\n").into_bytes(),
        }];
        match self
            .gateway
            .commit(&ops, &format!("range abandoned {a}-{b}"))
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("range abandon write failed | range={a}-{b} | err={e}");
                false
            }
        }
    }

    /// Refresh the lease timestamp and persist the progress snapshot in one
    /// commit, at most once per second. Returns whether a commit was made.
    pub fn heartbeat(&self, a: u64, b: u64, snapshot: &ProgressSnapshot) -> bool {
        let now = now_ts();
        {
            let mut st = self.state.lock().unwrap();
            if now - st.last_heartbeat < HEARTBEAT_MIN_INTERVAL_SECS {
                return false;
            }
            st.last_heartbeat = now;
        }
        let body = match serde_json::to_vec(snapshot) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let ops = [
            CommitOp::PutBytes {
                path: Self::lock_path(a, b),
                bytes: encode_lease(now, &self.owner_id, None),
            },
            CommitOp::PutBytes {
                path: Self::progress_path(a, b),
                bytes: body,
            },
        ];
        match self
            .gateway
            .commit(&ops, &format!("range heartbeat {a}-{b}"))
        {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("range heartbeat failed | range={a}-{b} | err={e}");
                false
            }
        }
    }

    pub fn write_progress(&self, a: u64, b: u64, snapshot: &ProgressSnapshot) -> bool {
        let body = match serde_json::to_vec(snapshot) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let ops = [CommitOp::PutBytes {
            path: Self::progress_path(a, b),
            bytes: body,
        }];
        match self
            .gateway
            .commit(&ops, &format!("range progress {a}-{b}"))
        {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("range progress write failed | range={a}-{b} | err={e}");
                false
            }
        }
    }

    pub fn read_progress(&self, a: u64, b: u64) -> Option<ProgressSnapshot> {
        let local = self.gateway.download(&Self::progress_path(a, b)).ok()?;
        let bytes = std::fs::read(&local).ok()?;
        let _ = std::fs::remove_file(&local);
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::OrderedProgress;
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

    #[test]
    fn range_names_parse_strictly() {
        assert_eq!(parse_range_name("0-29"), Some((0, 29)));
        assert_eq!(parse_range_name(" 30-59 "), Some((30, 59)));
        assert_eq!(parse_range_name("59-30"), None);
        assert_eq!(parse_range_name("a-b"), None);
        assert_eq!(parse_range_name("12"), None);
        assert_eq!(parse_range_name("-5"), None);
        assert_eq!(parse_range_name("1-2-3"), None);
    }

    #[test]
    fn done_prefix_requires_contiguity_from_zero() {
        let mut done = BTreeSet::new();
        assert_eq!(compute_done_prefix(&done), 0);
        done.insert((30, 59));
        assert_eq!(compute_done_prefix(&done), 0);
        done.insert((0, 29));
        assert_eq!(compute_done_prefix(&done), 60);
        done.insert((90, 119));
        assert_eq!(compute_done_prefix(&done), 60);
        done.insert((60, 89));
        assert_eq!(compute_done_prefix(&done), 120);
    }

    #[test]
    fn exclusive_range_lock_between_workers() {
        let repo = Arc::new(MemRepo::new());
        let a = RangeClaims::new(gateway(&repo), "worker-a", 3600.0);
        let b = RangeClaims::new(gateway(&repo), "worker-b", 3600.0);
        assert!(a.try_lock_range(0, 29));
        assert!(!b.try_lock_range(0, 29));
        assert!(b.try_lock_range(30, 59));
    }

    #[test]
    fn done_range_is_never_relockable() {
        let repo = Arc::new(MemRepo::new());
        let a = RangeClaims::new(gateway(&repo), "worker-a", 3600.0);
        assert!(a.try_lock_range(0, 29));
        assert!(a.mark_done_range(0, 29));
        assert!(!a.try_lock_range(0, 29));
        // A fresh store sees the marker through the listing too.
        let b = RangeClaims::new(gateway(&repo), "worker-b", 3600.0);
        assert!(!b.try_lock_range(0, 29));
        assert_eq!(b.done_prefix(), 30);
    }

    #[test]
    fn stale_range_lease_is_recyclable() {
        let repo = Arc::new(MemRepo::new());
        repo.put(
            "ranges/locks/0-29",
            &encode_lease(now_ts() - 100_000.0, "dead", None),
        );
        let b = RangeClaims::new(gateway(&repo), "worker-b", 3600.0);
        assert!(b.try_lock_range(0, 29));
    }

    #[test]
    fn refresh_done_prefix_sees_other_workers() {
        let repo = Arc::new(MemRepo::new());
        let a = RangeClaims::new(gateway(&repo), "worker-a", 3600.0);
        assert_eq!(a.done_prefix(), 0);
        repo.put("ranges/done/0-29", b"");
        repo.put("ranges/done/30-59", b"");
        assert_eq!(a.refresh_done_prefix(), 60);
    }

    #[test]
    fn heartbeat_is_throttled_and_persists_progress() {
        let repo = Arc::new(MemRepo::new());
        let a = RangeClaims::new(gateway(&repo), "worker-a", 3600.0);
        assert!(a.try_lock_range(0, 29));

        let mut prog = OrderedProgress::new(0, 29, 0);
        prog.mark_done(0);
        let mut snap = prog.to_snapshot();
        snap.extra
            .insert("page".to_string(), serde_json::json!(1));

        assert!(a.heartbeat(0, 29, &snap));
        // Immediately again: suppressed by the 1 Hz floor.
        assert!(!a.heartbeat(0, 29, &snap));

        let restored = a.read_progress(0, 29).unwrap();
        assert_eq!(restored.frontier, 1);
        assert_eq!(restored.extra.get("page"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn abandonment_records_reason_without_releasing() {
        let repo = Arc::new(MemRepo::new());
        let a = RangeClaims::new(gateway(&repo), "worker-a", 3600.0);
        assert!(a.try_lock_range(0, 29));
        assert!(a.mark_abandoned_range(0, 29, "stopped"));
        let rec: serde_json::Value =
            serde_json::from_slice(&repo.get("ranges/abandoned/0-29").unwrap()).unwrap();
        assert_eq!(rec["reason"], "stopped");
        assert_eq!(rec["owner"], "worker-a");
        // Lease still present, so another worker cannot take it yet.
        let b = RangeClaims::new(gateway(&repo), "worker-b", 3600.0);
        assert!(!b.try_lock_range(0, 29));
    }
}
