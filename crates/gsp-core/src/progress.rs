//! Per-range progress bookkeeping.
//!
//! A worker holding a range lease tracks every offset inside the range:
//! confirmed done, claimed elsewhere (with an expiry), erroring (with a
//! retry hold), or still open. Open offsets at or after the frontier live
//! in `holes`, a sorted list of disjoint closed intervals merged on insert.
//! The frontier is the smallest offset not known done or claimed; it only
//! moves forward.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Serialized form persisted through the range store. Auxiliary keys
/// (current page, page size, acquisition time) ride along in `extra` and
/// are ignored on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub range_start: u64,
    pub range_end: u64,
    pub frontier: u64,
    pub holes: Vec<(u64, u64)>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct OrderedProgress {
    range_start: u64,
    /// Inclusive upper bound.
    range_end: u64,
    frontier: u64,
    holes: Vec<(u64, u64)>,
    offset_to_id: HashMap<u64, String>,
    done_confirmed: HashSet<u64>,
    claimed: HashSet<u64>,
    blocked_until: HashMap<u64, f64>,
}

impl OrderedProgress {
    pub fn new(range_start: u64, range_end: u64, frontier: u64) -> Self {
        Self {
            range_start,
            range_end,
            frontier: frontier.max(range_start),
            holes: Vec::new(),
            offset_to_id: HashMap::new(),
            done_confirmed: HashSet::new(),
            claimed: HashSet::new(),
            blocked_until: HashMap::new(),
        }
    }

    pub fn range(&self) -> (u64, u64) {
        (self.range_start, self.range_end)
    }

    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    pub fn has_pending(&self) -> bool {
        !self.holes.is_empty()
    }

    pub fn id_at(&self, offset: u64) -> Option<&str> {
        self.offset_to_id.get(&offset).map(|s| s.as_str())
    }

    fn in_range(&self, offset: u64) -> bool {
        offset >= self.range_start && offset <= self.range_end
    }

    /// Record which item id was observed at an offset this run. Ids are
    /// in-memory only; a restored snapshot has holes but no ids until the
    /// pages are re-listed.
    pub fn remember(&mut self, offset: u64, id: &str) {
        let id = id.trim();
        if !self.in_range(offset) || id.is_empty() {
            return;
        }
        self.offset_to_id.insert(offset, id.to_string());
    }

    fn add_hole_point(&mut self, offset: u64) {
        if !self.in_range(offset) || offset < self.frontier {
            return;
        }
        for &(l, r) in &self.holes {
            if l <= offset && offset <= r {
                return;
            }
        }
        let mut new_l = offset;
        let mut new_r = offset;
        let mut out: Vec<(u64, u64)> = Vec::with_capacity(self.holes.len() + 1);
        let mut inserted = false;
        for &(l, r) in &self.holes {
            if r + 1 < new_l {
                out.push((l, r));
                continue;
            }
            if new_r + 1 < l {
                if !inserted {
                    out.push((new_l, new_r));
                    inserted = true;
                }
                out.push((l, r));
                continue;
            }
            new_l = new_l.min(l);
            new_r = new_r.max(r);
        }
        if !inserted {
            out.push((new_l, new_r));
        }
        out.sort_by_key(|&(l, _)| l);
        self.holes = out;
    }

    fn remove_hole_point(&mut self, offset: u64) {
        if self.holes.is_empty() {
            return;
        }
        let mut out: Vec<(u64, u64)> = Vec::with_capacity(self.holes.len() + 1);
        for &(l, r) in &self.holes {
            if offset < l || offset > r {
                out.push((l, r));
                continue;
            }
            if l == r && l == offset {
                continue;
            }
            if offset == l {
                out.push((l + 1, r));
                continue;
            }
            if offset == r {
                out.push((l, r - 1));
                continue;
            }
            out.push((l, offset - 1));
            out.push((offset + 1, r));
        }
        self.holes = out;
    }

    fn advance_frontier(&mut self) {
        while self.done_confirmed.contains(&self.frontier) || self.claimed.contains(&self.frontier)
        {
            self.frontier += 1;
        }
    }

    fn block(&mut self, offset: u64, until: f64) {
        if !self.in_range(offset) {
            return;
        }
        // Deadlines only extend; a shorter hold never shortens a longer one.
        let entry = self.blocked_until.entry(offset).or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    /// An offset was listed but is not ours to advance past yet.
    pub fn mark_seen_unfinished(&mut self, offset: u64) {
        self.add_hole_point(offset);
    }

    /// Confirmed done on the shared repository.
    pub fn mark_done(&mut self, offset: u64) {
        if !self.in_range(offset) {
            return;
        }
        self.done_confirmed.insert(offset);
        self.claimed.remove(&offset);
        self.blocked_until.remove(&offset);
        self.remove_hole_point(offset);
        self.advance_frontier();
    }

    /// Claimed (by us or another worker) for `hold_secs` from `now`.
    pub fn mark_claimed(&mut self, offset: u64, hold_secs: f64, now: f64) {
        self.mark_claimed_until(offset, now + hold_secs.max(5.0));
    }

    /// Claimed until an absolute deadline.
    pub fn mark_claimed_until(&mut self, offset: u64, until: f64) {
        if !self.in_range(offset) {
            return;
        }
        self.claimed.insert(offset);
        self.remove_hole_point(offset);
        self.block(offset, until);
        self.advance_frontier();
    }

    /// An attempt errored; leave the offset open but hold it back.
    pub fn mark_error_retry(&mut self, offset: u64, hold_secs: f64, now: f64) {
        if !self.in_range(offset) {
            return;
        }
        self.add_hole_point(offset);
        self.block(offset, now + hold_secs.max(1.0));
    }

    /// Claims whose deadline passed become holes again (unless done).
    pub fn refresh_expired(&mut self, now: f64) {
        let expired: Vec<u64> = self
            .claimed
            .iter()
            .copied()
            .filter(|o| self.blocked_until.get(o).copied().unwrap_or(0.0) <= now)
            .collect();
        for o in expired {
            self.claimed.remove(&o);
            self.blocked_until.remove(&o);
            if !self.done_confirmed.contains(&o) {
                self.add_hole_point(o);
            }
        }
    }

    /// Leftmost hole offset that is at or past the frontier, has a
    /// remembered id, and is not blocked. Expired claims are refreshed
    /// first.
    pub fn next_hole_offset(&mut self, now: f64) -> Option<u64> {
        self.refresh_expired(now);
        for &(l, r) in &self.holes {
            for o in l..=r {
                if o < self.frontier {
                    continue;
                }
                if !self.offset_to_id.contains_key(&o) {
                    continue;
                }
                if self.blocked_until.get(&o).copied().unwrap_or(0.0) > now {
                    continue;
                }
                return Some(o);
            }
        }
        None
    }

    pub fn to_snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            range_start: self.range_start,
            range_end: self.range_end,
            frontier: self.frontier,
            holes: self.holes.clone(),
            extra: serde_json::Map::new(),
        }
    }

    /// Restore frontier and holes from a persisted snapshot. Values are
    /// validated against this range: the frontier must land inside
    /// `[start, end+1]`, holes are clamped and re-sorted, inverted or
    /// out-of-range entries dropped.
    pub fn apply_snapshot(&mut self, snap: &ProgressSnapshot) {
        if snap.frontier >= self.range_start && snap.frontier <= self.range_end + 1 {
            self.frontier = snap.frontier;
        }
        let mut out = Vec::new();
        for &(l, r) in &snap.holes {
            if r < l {
                continue;
            }
            let ll = l.max(self.range_start);
            let rr = r.min(self.range_end);
            if ll <= rr {
                out.push((ll, rr));
            }
        }
        out.sort_by_key(|&(l, _)| l);
        self.holes = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prog() -> OrderedProgress {
        OrderedProgress::new(0, 29, 0)
    }

    #[test]
    fn frontier_advances_over_done_and_claimed() {
        let mut p = prog();
        assert_eq!(p.frontier(), 0);
        p.mark_done(0);
        assert_eq!(p.frontier(), 1);
        p.mark_claimed_until(1, 1_000.0);
        assert_eq!(p.frontier(), 2);
        p.mark_done(2);
        assert_eq!(p.frontier(), 3);
        // Out-of-order done does not move the frontier past an open offset.
        p.mark_done(5);
        assert_eq!(p.frontier(), 3);
        p.mark_done(3);
        p.mark_done(4);
        assert_eq!(p.frontier(), 6);
    }

    #[test]
    fn holes_merge_on_insert() {
        let mut p = prog();
        p.mark_seen_unfinished(3);
        p.mark_seen_unfinished(5);
        p.mark_seen_unfinished(4);
        p.mark_seen_unfinished(10);
        assert_eq!(p.to_snapshot().holes, vec![(3, 5), (10, 10)]);
        // Duplicate insert is a no-op.
        p.mark_seen_unfinished(4);
        assert_eq!(p.to_snapshot().holes, vec![(3, 5), (10, 10)]);
    }

    #[test]
    fn hole_point_removal_splits_intervals() {
        let mut p = prog();
        for o in 3..=7 {
            p.mark_seen_unfinished(o);
        }
        p.mark_done(5);
        assert_eq!(p.to_snapshot().holes, vec![(3, 4), (6, 7)]);
        p.mark_done(3);
        assert_eq!(p.to_snapshot().holes, vec![(4, 4), (6, 7)]);
        p.mark_done(7);
        assert_eq!(p.to_snapshot().holes, vec![(4, 4), (6, 6)]);
        p.mark_done(4);
        p.mark_done(6);
        assert!(!p.has_pending());
    }

    #[test]
    fn next_hole_skips_unremembered_and_blocked() {
        let mut p = prog();
        p.mark_seen_unfinished(2);
        p.mark_seen_unfinished(3);
        p.mark_seen_unfinished(4);
        // No remembered ids at all: nothing actionable.
        assert_eq!(p.next_hole_offset(100.0), None);
        p.remember(3, "abc");
        p.remember(4, "def");
        assert_eq!(p.next_hole_offset(100.0), Some(3));
        p.mark_error_retry(3, 50.0, 100.0);
        assert_eq!(p.next_hole_offset(100.0), Some(4));
        // The hold lapses.
        assert_eq!(p.next_hole_offset(151.0), Some(3));
    }

    #[test]
    fn expired_claims_become_holes_again() {
        let mut p = prog();
        p.remember(0, "a");
        p.mark_claimed_until(0, 200.0);
        assert_eq!(p.frontier(), 1);
        assert_eq!(p.next_hole_offset(100.0), None);
        p.refresh_expired(250.0);
        // The offset reopens behind the frontier but stays visible as a
        // hole for the next scan only if at/after frontier; frontier
        // already moved past it, so the hole insert is rejected.
        assert_eq!(p.next_hole_offset(250.0), None);

        // A claim past the frontier does reopen.
        let mut p = prog();
        p.remember(5, "b");
        p.mark_seen_unfinished(4);
        p.mark_claimed_until(5, 200.0);
        p.refresh_expired(250.0);
        assert_eq!(p.next_hole_offset(250.0), Some(5));
    }

    #[test]
    fn blocked_deadline_only_extends() {
        let mut p = prog();
        p.remember(2, "x");
        p.mark_error_retry(2, 100.0, 0.0);
        p.mark_error_retry(2, 10.0, 0.0);
        assert_eq!(p.next_hole_offset(50.0), None);
        assert_eq!(p.next_hole_offset(101.0), Some(2));
    }

    #[test]
    fn snapshot_roundtrip_and_clamping() {
        let mut p = prog();
        p.mark_seen_unfinished(3);
        p.mark_seen_unfinished(4);
        p.mark_done(0);
        let snap = p.to_snapshot();
        assert_eq!(snap.frontier, 1);
        assert_eq!(snap.holes, vec![(3, 4)]);

        let json = serde_json::to_string(&snap).unwrap();
        let parsed: ProgressSnapshot = serde_json::from_str(&json).unwrap();
        let mut q = OrderedProgress::new(0, 29, 0);
        q.apply_snapshot(&parsed);
        assert_eq!(q.frontier(), 1);
        assert_eq!(q.to_snapshot().holes, vec![(3, 4)]);

        // Hostile snapshot: frontier outside the range is ignored, holes
        // clamped into the range, inverted pairs dropped.
        let bad = ProgressSnapshot {
            range_start: 0,
            range_end: 29,
            frontier: 99,
            holes: vec![(28, 40), (7, 3), (50, 60)],
            extra: serde_json::Map::new(),
        };
        q.apply_snapshot(&bad);
        assert_eq!(q.frontier(), 1);
        assert_eq!(q.to_snapshot().holes, vec![(28, 29)]);
    }

    #[test]
    fn snapshot_extra_keys_survive_parsing() {
        let json = r#"{"range_start":0,"range_end":29,"frontier":12,"holes":[[3,4]],"page":2,"pp":30}"#;
        let snap: ProgressSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.frontier, 12);
        assert_eq!(snap.extra.get("page"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn out_of_range_offsets_are_ignored() {
        let mut p = OrderedProgress::new(30, 59, 30);
        p.remember(10, "x");
        p.mark_seen_unfinished(10);
        p.mark_done(99);
        assert!(!p.has_pending());
        assert_eq!(p.frontier(), 30);
    }
}
