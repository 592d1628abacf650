//! Per-user cooldown gate for manual backup triggers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of consulting the limiter. `Throttled` is a policy rejection, not
/// an error; no run is started and no history entry is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Ok,
    Throttled { remaining: Duration },
}

impl RateLimitDecision {
    /// Human-readable wait time, seconds rounded up: `"4m 50s"` or `"30s"`.
    pub fn retry_after(&self) -> Option<String> {
        match self {
            RateLimitDecision::Ok => None,
            RateLimitDecision::Throttled { remaining } => {
                let mut secs = remaining.as_secs();
                if remaining.subsec_nanos() > 0 {
                    secs += 1;
                }
                let label = if secs >= 60 {
                    format!("{}m {}s", secs / 60, secs % 60)
                } else {
                    format!("{secs}s")
                };
                Some(label)
            }
        }
    }
}

/// Tracks the last allowed invocation per user id.
///
/// Entries are never evicted, so the map grows by one entry per distinct
/// user over the process lifetime. Accepted for now; a pruning pass over
/// entries older than the window would cap it.
pub struct RateLimiter {
    window: Duration,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    /// A zero-minute window disables limiting entirely.
    pub fn new(window_minutes: u64) -> Self {
        Self {
            window: Duration::from_secs(window_minutes * 60),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Check the cooldown for `user_id` and, if allowed, record this
    /// invocation. A single lock acquisition covers both the read and the
    /// write, so two checks can never interleave.
    pub fn check_and_record(&self, user_id: &str) -> RateLimitDecision {
        self.check_and_record_at(user_id, Instant::now())
    }

    fn check_and_record_at(&self, user_id: &str, now: Instant) -> RateLimitDecision {
        if self.window.is_zero() {
            return RateLimitDecision::Ok;
        }

        let mut last_seen = self.last_seen.lock().unwrap();
        match last_seen.get(user_id) {
            Some(last) if now.duration_since(*last) < self.window => {
                let remaining = self.window - now.duration_since(*last);
                RateLimitDecision::Throttled { remaining }
            }
            _ => {
                last_seen.insert(user_id.to_string(), now);
                RateLimitDecision::Ok
            }
        }
    }
}
