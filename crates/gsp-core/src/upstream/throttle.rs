//! Process-wide upstream throttle state.
//!
//! Every API caller funnels through one instance: a slot gate enforcing a
//! minimum interval between calls, exponential backoff when the server
//! pushes back without a hint, and a sticky rate-limited flag when the
//! worker is configured to stand down for the hour instead of hammering.

use std::sync::Mutex;

use crate::now_ts;

/// Minimum spacing after a successful call.
pub const DEFAULT_MIN_INTERVAL_SECS: f64 = 1.2;
/// Backoff start and cap when no Retry-After was sent.
const BACKOFF_START_SECS: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 120.0;
/// Stand-down applied under stop-on-rate-limit with no hint.
const HARD_STOP_SECS: f64 = 3600.0;

#[derive(Debug, Default)]
struct Inner {
    next_allowed: f64,
    backoff: f64,
    rate_limited: bool,
}

#[derive(Debug)]
pub struct ThrottleState {
    inner: Mutex<Inner>,
    stop_on_rate_limit: bool,
}

impl ThrottleState {
    pub fn new(stop_on_rate_limit: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stop_on_rate_limit,
        }
    }

    /// Seconds until the next call is allowed, from `now`.
    pub fn slot_wait(&self, now: f64) -> f64 {
        let inner = self.inner.lock().unwrap();
        (inner.next_allowed - now).max(0.0)
    }

    /// Sleep until the shared slot opens.
    pub fn wait_for_slot(&self) {
        let wait = self.slot_wait(now_ts());
        if wait > 0.0 {
            tracing::debug!("api throttle: waiting {:.2}s", wait);
            std::thread::sleep(std::time::Duration::from_secs_f64(wait));
        }
    }

    /// A call completed normally: clear backoff, space the next call.
    pub fn note_ok_at(&self, now: f64, min_interval: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.backoff = 0.0;
        inner.next_allowed = now + min_interval;
    }

    pub fn note_ok(&self, min_interval: f64) {
        self.note_ok_at(now_ts(), min_interval);
    }

    /// The server throttled us. Returns the wait that was applied.
    pub fn note_throttled_at(&self, now: f64, retry_after: Option<f64>) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let wait = match retry_after {
            Some(hint) => {
                let hint = hint.max(0.0);
                let wait = if self.stop_on_rate_limit {
                    hint.max(HARD_STOP_SECS)
                } else {
                    hint
                };
                inner.backoff = inner.backoff.max(wait);
                wait
            }
            None => {
                if self.stop_on_rate_limit {
                    inner.backoff = HARD_STOP_SECS;
                    HARD_STOP_SECS
                } else {
                    inner.backoff = if inner.backoff <= 0.0 {
                        BACKOFF_START_SECS
                    } else {
                        (inner.backoff * 2.0).min(BACKOFF_CAP_SECS)
                    };
                    inner.backoff
                }
            }
        };
        if self.stop_on_rate_limit {
            inner.rate_limited = true;
        }
        inner.next_allowed = now + wait;
        wait
    }

    pub fn note_throttled(&self, retry_after: Option<f64>) -> f64 {
        self.note_throttled_at(now_ts(), retry_after)
    }

    /// Sticky flag: set on a throttle under stop-on-rate-limit, observed by
    /// the discover stage to stand down.
    pub fn is_rate_limited(&self) -> bool {
        self.inner.lock().unwrap().rate_limited
    }

    /// How long a standing-down caller should sleep before rechecking.
    pub fn rate_limit_wait(&self, default_secs: f64) -> f64 {
        let inner = self.inner.lock().unwrap();
        if !inner.rate_limited {
            return 0.0;
        }
        let wait = inner.next_allowed - now_ts();
        if wait <= 0.0 {
            default_secs
        } else {
            wait
        }
    }

    pub fn clear_rate_limited(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.rate_limited = false;
        inner.backoff = 0.0;
        inner.next_allowed = inner.next_allowed.min(now_ts() + 0.1);
    }
}
