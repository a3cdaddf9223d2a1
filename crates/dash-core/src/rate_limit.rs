//! Fixed-window request rate limiter keyed by client
//!
//! Each key gets `limit` requests per window. The window starts with the
//! first request after the previous one expired.

use crate::clock::{system_clock, SharedClock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

pub const DEFAULT_RATE_LIMIT: u32 = 60;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: i64,
}

/// Outcome of a rejected request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub limit: u32,
    /// Milliseconds until the window resets
    pub retry_after_ms: i64,
    /// Unix time in ms at which the window resets
    pub reset_at: i64,
}

impl RateLimited {
    /// `Retry-After` value, rounded up to whole seconds
    pub fn retry_after_secs(&self) -> i64 {
        (self.retry_after_ms + 999) / 1000
    }
}

pub struct RateLimiter {
    windows: DashMap<String, Window>,
    limit: u32,
    window_millis: i64,
    clock: SharedClock,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW, system_clock())
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration, clock: SharedClock) -> Self {
        Self {
            windows: DashMap::new(),
            limit: limit.max(1),
            window_millis: window.as_millis() as i64,
            clock,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one request for `key`
    pub fn check(&self, key: &str) -> std::result::Result<(), RateLimited> {
        let now = self.clock.now_millis();

        match self.windows.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Window {
                    count: 1,
                    reset_at: now + self.window_millis,
                });
                Ok(())
            }
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                if window.reset_at < now {
                    *window = Window {
                        count: 1,
                        reset_at: now + self.window_millis,
                    };
                    Ok(())
                } else if window.count >= self.limit {
                    Err(RateLimited {
                        limit: self.limit,
                        retry_after_ms: (window.reset_at - now).max(0),
                        reset_at: window.reset_at,
                    })
                } else {
                    window.count += 1;
                    Ok(())
                }
            }
        }
    }

    /// Milliseconds until `key`'s window resets, 0 if it has none
    pub fn retry_after_ms(&self, key: &str) -> i64 {
        let now = self.clock.now_millis();
        self.windows
            .get(key)
            .filter(|window| window.reset_at >= now)
            .map(|window| window.reset_at - now)
            .unwrap_or(0)
    }

    /// Drop expired windows; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at >= now);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
