//! Policy layer over the shared repository.
//!
//! The gateway is what the rest of the worker talks to. It serializes
//! commits process-wide, retries optimistic-concurrency conflicts with
//! jittered backoff, honours rate-limit hints without consuming retry
//! attempts, falls back to a pull-request commit when the server demands
//! one, caches existence probes, and keeps the recommended commit batch
//! size that the commit stage reads under rate-limit pressure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use super::error::rate_limit_wait;
use super::{CommitOp, ObjectRepo, RepoError};

/// Retry discipline for conflicting commits.
#[derive(Debug, Clone, Copy)]
pub struct CommitRetryPolicy {
    /// Maximum commit attempts (including the first).
    pub max_attempts: u32,
    /// Base delay; attempt n waits `min(max_delay, base · 2^n) · jitter`.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wait for a rate limit with no usable hint.
    pub throttle_fallback: Duration,
}

impl Default for CommitRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            throttle_fallback: Duration::from_secs(5),
        }
    }
}

impl CommitRetryPolicy {
    /// Backoff before retrying conflict number `attempt` (0-based), with
    /// jitter uniform in [0.5, 1.5).
    fn conflict_backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.min(8);
        let raw = self
            .base_delay
            .saturating_mul(exp)
            .min(self.max_delay)
            .as_secs_f64();
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(raw * jitter)
    }

    /// Jittered wait for a throttled commit; attempts are not consumed.
    fn throttle_backoff(&self, hinted: Option<Duration>) -> Duration {
        let base = hinted.unwrap_or(self.throttle_fallback).as_secs_f64().max(1.0);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(base * jitter)
    }
}

const BATCH_MAX: u32 = 64;
/// Recommendation decays after this long without a rate-limit hit.
const BATCH_DECAY: Duration = Duration::from_secs(1800);

struct BatchRecommendation {
    size: u32,
    last_hit: Option<Instant>,
}

struct ExistsCache {
    entries: HashMap<String, (bool, Instant)>,
}

pub struct RepoGateway {
    repo: Arc<dyn ObjectRepo>,
    policy: CommitRetryPolicy,
    /// Serializes commits so concurrent batches do not trade 412s.
    commit_lock: Mutex<()>,
    exists: Mutex<ExistsCache>,
    batch: Mutex<BatchRecommendation>,
}

impl RepoGateway {
    pub fn new(repo: Arc<dyn ObjectRepo>) -> Self {
        Self::with_policy(repo, CommitRetryPolicy::default())
    }

    pub fn with_policy(repo: Arc<dyn ObjectRepo>, policy: CommitRetryPolicy) -> Self {
        Self {
            repo,
            policy,
            commit_lock: Mutex::new(()),
            exists: Mutex::new(ExistsCache {
                entries: HashMap::new(),
            }),
            batch: Mutex::new(BatchRecommendation {
                size: 1,
                last_hit: None,
            }),
        }
    }

    pub fn list_files(&self, prefix: &str) -> Result<Vec<String>, RepoError> {
        self.repo.list_files(prefix)
    }

    pub fn download(&self, path: &str) -> Result<std::path::PathBuf, RepoError> {
        self.repo.download(path)
    }

    /// Best-effort existence probe with a positive/negative cache. Errors
    /// read as "absent": callers use this only to skip work early and the
    /// claim protocol stays correct without it.
    pub fn file_exists_cached(&self, path: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        {
            let cache = self.exists.lock().unwrap();
            if let Some((ok, at)) = cache.entries.get(path) {
                if now.duration_since(*at) <= ttl {
                    return *ok;
                }
            }
        }
        let ok = self.repo.file_exists(path).unwrap_or(false);
        let mut cache = self.exists.lock().unwrap();
        cache.entries.insert(path.to_string(), (ok, now));
        ok
    }

    /// Record a rate-limit hit: double the recommended batch size up to 64.
    pub fn note_rate_limit(&self) {
        let mut rec = self.batch.lock().unwrap();
        rec.last_hit = Some(Instant::now());
        rec.size = if rec.size < 2 {
            2
        } else {
            (rec.size * 2).min(BATCH_MAX)
        };
    }

    /// Batch size the commit stage should coalesce to: the configured size,
    /// raised by the rate-limit recommendation, which halves back toward 1
    /// after 30 minutes without a hit.
    pub fn recommended_batch_size(&self, configured: u32) -> u32 {
        let base = configured.clamp(1, BATCH_MAX);
        let mut rec = self.batch.lock().unwrap();
        if rec.size > 1 {
            if let Some(last) = rec.last_hit {
                if last.elapsed() >= BATCH_DECAY {
                    rec.size = (rec.size / 2).max(1);
                    rec.last_hit = Some(Instant::now());
                }
            }
        }
        base.max(rec.size.clamp(1, BATCH_MAX))
    }

    /// Commit with the full retry discipline. Observably at-most-once on
    /// success: the caller sees a single `Ok` regardless of how many
    /// attempts the gateway spent.
    pub fn commit(&self, ops: &[CommitOp], message: &str) -> Result<(), RepoError> {
        let mut conflicts: u32 = 0;
        loop {
            let result = {
                let _serial = self.commit_lock.lock().unwrap();
                self.repo.commit(ops, message)
            };
            let err = match result {
                Ok(()) => {
                    self.invalidate_paths(ops);
                    return Ok(());
                }
                Err(e) => e,
            };
            match err {
                RepoError::UsePullRequest => {
                    tracing::info!("commit refused, retrying once as pull request | msg={message}");
                    let _serial = self.commit_lock.lock().unwrap();
                    let out = self.repo.commit_as_pr(ops, message);
                    if out.is_ok() {
                        self.invalidate_paths(ops);
                    }
                    return out;
                }
                RepoError::TooManyRequests { .. } => {
                    self.note_rate_limit();
                    let wait = self.policy.throttle_backoff(rate_limit_wait(&err));
                    tracing::warn!(
                        "commit rate limited, waiting {:.1}s | msg={message}",
                        wait.as_secs_f64()
                    );
                    std::thread::sleep(wait);
                    // Throttle waits do not consume conflict attempts.
                }
                RepoError::PreconditionFailed => {
                    conflicts += 1;
                    if conflicts >= self.policy.max_attempts {
                        return Err(RepoError::PreconditionFailed);
                    }
                    let wait = self.policy.conflict_backoff(conflicts - 1);
                    tracing::debug!(
                        "commit conflict, retrying in {:.2}s | attempt={}/{} | msg={message}",
                        wait.as_secs_f64(),
                        conflicts + 1,
                        self.policy.max_attempts
                    );
                    std::thread::sleep(wait);
                }
                other => return Err(other),
            }
        }
    }

    pub fn squash_history(&self, message: &str) -> Result<(), RepoError> {
        let _serial = self.commit_lock.lock().unwrap();
        self.repo.squash_history(message)
    }

    /// A successful commit makes its paths exist; refresh the cache rather
    /// than waiting out stale negative entries.
    fn invalidate_paths(&self, ops: &[CommitOp]) {
        let now = Instant::now();
        let mut cache = self.exists.lock().unwrap();
        for op in ops {
            cache.entries.insert(op.path().to_string(), (true, now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::mem::MemRepo;

    fn fast_policy() -> CommitRetryPolicy {
        CommitRetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            throttle_fallback: Duration::from_millis(2),
        }
    }

    fn gateway_over(repo: Arc<MemRepo>) -> RepoGateway {
        RepoGateway::with_policy(repo, fast_policy())
    }

    fn put_op(path: &str) -> CommitOp {
        CommitOp::PutBytes {
            path: path.to_string(),
            bytes: b"payload".to_vec(),
        }
    }

    #[test]
    fn conflict_is_retried_then_succeeds() {
        let repo = Arc::new(MemRepo::new());
        for _ in 0..3 {
            repo.inject_commit_fault(RepoError::PreconditionFailed);
        }
        let gw = gateway_over(Arc::clone(&repo));
        gw.commit(&[put_op("a/b")], "add a/b").unwrap();
        // Three failed attempts plus the successful fourth.
        assert_eq!(repo.commit_count(), 1);
        assert!(repo.file_exists("a/b").unwrap());
    }

    #[test]
    fn conflict_budget_is_bounded() {
        let repo = Arc::new(MemRepo::new());
        for _ in 0..6 {
            repo.inject_commit_fault(RepoError::PreconditionFailed);
        }
        let gw = gateway_over(Arc::clone(&repo));
        assert_eq!(
            gw.commit(&[put_op("a")], "m").unwrap_err(),
            RepoError::PreconditionFailed
        );
    }

    #[test]
    fn throttle_waits_do_not_consume_attempts() {
        let repo = Arc::new(MemRepo::new());
        // More throttles than the conflict budget, then conflicts, then ok.
        for _ in 0..8 {
            repo.inject_commit_fault(RepoError::TooManyRequests {
                retry_after: Some(Duration::from_millis(1)),
                message: "slow".into(),
            });
        }
        for _ in 0..4 {
            repo.inject_commit_fault(RepoError::PreconditionFailed);
        }
        let gw = gateway_over(Arc::clone(&repo));
        gw.commit(&[put_op("a")], "m").unwrap();
        assert_eq!(repo.commit_count(), 1);
    }

    #[test]
    fn use_pull_request_retries_once_as_pr() {
        let repo = Arc::new(MemRepo::new());
        repo.inject_commit_fault(RepoError::UsePullRequest);
        let gw = gateway_over(Arc::clone(&repo));
        gw.commit(&[put_op("a")], "m").unwrap();
        assert_eq!(repo.pr_commit_count(), 1);
        assert!(repo.file_exists("a").unwrap());
    }

    #[test]
    fn rate_limit_grows_recommendation_and_caps() {
        let repo = Arc::new(MemRepo::new());
        let gw = gateway_over(repo);
        assert_eq!(gw.recommended_batch_size(1), 1);
        gw.note_rate_limit();
        assert_eq!(gw.recommended_batch_size(1), 2);
        for _ in 0..10 {
            gw.note_rate_limit();
        }
        assert_eq!(gw.recommended_batch_size(1), 64);
        // The configured floor never lowers an escalated recommendation.
        assert_eq!(gw.recommended_batch_size(8), 64);
    }

    #[test]
    fn exists_cache_serves_within_ttl() {
        let repo = Arc::new(MemRepo::new());
        let gw = gateway_over(Arc::clone(&repo));
        assert!(!gw.file_exists_cached("done/x", Duration::from_secs(60)));
        repo.put("done/x", b"");
        // Cached negative answer until the TTL lapses.
        assert!(!gw.file_exists_cached("done/x", Duration::from_secs(60)));
        assert!(gw.file_exists_cached("done/x", Duration::ZERO));
    }

    #[test]
    fn commit_refreshes_exists_cache() {
        let repo = Arc::new(MemRepo::new());
        let gw = gateway_over(Arc::clone(&repo));
        assert!(!gw.file_exists_cached("done/y", Duration::from_secs(60)));
        gw.commit(&[put_op("done/y")], "done y").unwrap();
        assert!(gw.file_exists_cached("done/y", Duration::from_secs(60)));
    }

    #[test]
    fn conflict_backoff_grows_and_caps() {
        let p = CommitRetryPolicy::default();
        let d0 = p.conflict_backoff(0);
        assert!(d0 >= Duration::from_millis(250) && d0 < Duration::from_millis(750));
        let d4 = p.conflict_backoff(4);
        // Capped at max_delay before jitter: 8s · [0.5, 1.5).
        assert!(d4 >= Duration::from_secs(4) && d4 < Duration::from_secs(12));
    }
}
