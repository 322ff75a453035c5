//! Passive health — per-target failure accounting
//!
//! Targets that keep answering with 5xx are sidelined for a cooldown
//! window; strategies skip sidelined targets until the window elapses.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Failures within the window before a target is sidelined
const MAX_FAILS: u32 = 3;

/// Cooldown once sidelined, in milliseconds
const FAIL_TIMEOUT_MS: i64 = 10_000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Passive health state for one proxy target
#[derive(Debug, Default)]
pub struct PassiveHealth {
    failed: AtomicU32,
    down_until_ms: AtomicI64,
}

impl PassiveHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record upstream failures. Returns true when the target just got
    /// sidelined, which callers log as a warning.
    pub fn add_failed(&self, count: u32) -> bool {
        let total = self.failed.fetch_add(count, Ordering::Relaxed) + count;
        if total >= MAX_FAILS {
            self.failed.store(0, Ordering::Relaxed);
            self.down_until_ms
                .store(now_ms() + FAIL_TIMEOUT_MS, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Whether the target may receive traffic
    pub fn is_available(&self) -> bool {
        now_ms() >= self.down_until_ms.load(Ordering::Relaxed)
    }

    /// Clear all failure state
    pub fn reset(&self) {
        self.failed.store(0, Ordering::Relaxed);
        self.down_until_ms.store(0, Ordering::Relaxed);
    }
}
