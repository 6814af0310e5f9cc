//! Per-key sliding-window counters
//!
//! Backs the rapid-request detection (keyed by origin IP) and the
//! failed-login anomaly detection (keyed by email).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Number of tracked keys above which idle keys are swept
const SWEEP_THRESHOLD: usize = 10_000;

struct Windows {
    hits: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

/// Counts hits per key inside a trailing time window
///
/// Counts saturate at `2 * limit + 1`; callers only distinguish "within
/// limit", "over limit" and "over twice the limit".
pub struct SlidingWindowCounter {
    limit: usize,
    window: Duration,
    state: Mutex<Windows>,
}

impl SlidingWindowCounter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(Windows {
                hits: HashMap::new(),
                last_sweep: None,
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Largest count `hit` reports for one key
    pub fn saturation(&self) -> usize {
        self.limit.saturating_mul(2).saturating_add(1)
    }

    /// Record a hit for `key`; returns the hit count inside the window
    pub fn hit(&self, key: &str) -> usize {
        self.hit_at(key, Instant::now())
    }

    pub fn hit_at(&self, key: &str, now: Instant) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window;

        // At most one sweep per window
        let sweep_due = state
            .last_sweep
            .map(|last| now.saturating_duration_since(last) >= window)
            .unwrap_or(true);
        if state.hits.len() > SWEEP_THRESHOLD && sweep_due {
            state.hits.retain(|_, q| {
                q.back()
                    .map(|last| now.saturating_duration_since(*last) < window)
                    .unwrap_or(false)
            });
            state.last_sweep = Some(now);
        }

        let cap = self.saturation();
        let queue = state.hits.entry(key.to_string()).or_default();
        while let Some(front) = queue.front() {
            if now.saturating_duration_since(*front) >= window {
                queue.pop_front();
            } else {
                break;
            }
        }
        queue.push_back(now);
        while queue.len() > cap {
            queue.pop_front();
        }
        queue.len()
    }

    /// True once the count inside the window is above the limit
    pub fn is_exceeded(&self, count: usize) -> bool {
        count > self.limit
    }

    /// Forget all hits for `key`
    pub fn reset(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.hits.remove(key);
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hits
            .len()
    }
}
