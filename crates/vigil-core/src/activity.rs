//! Debounced activity tracking
//!
//! Collapses bursts of interaction signals into a single timestamp write.
//! The tracker is a pure state holder; the caller decides when to poll it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::LockPhase;

/// Interaction signal delivered by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySignal {
    Pointer,
    Key,
    Touch,
    Scroll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    /// First signal of the burst
    first_ms: u64,
    /// Most recent signal of the burst
    latest_ms: u64,
}

/// Trailing-edge debouncer with a maximum wait
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    window_ms: u64,
    max_wait_ms: u64,
    pending: Option<Pending>,
}

impl ActivityTracker {
    /// Continuous activity is still flushed every `10 * window`
    const MAX_WAIT_FACTOR: u64 = 10;

    pub fn new(window: Duration) -> Self {
        let window_ms = window.as_millis() as u64;
        Self {
            window_ms,
            max_wait_ms: window_ms.saturating_mul(Self::MAX_WAIT_FACTOR),
            pending: None,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Register a signal. Signals while locked are dropped along with any burst in progress.
    pub fn on_signal(&mut self, at_ms: u64, phase: LockPhase) {
        if phase.is_locked() {
            self.pending = None;
            return;
        }
        self.pending = Some(match self.pending {
            Some(p) => Pending {
                first_ms: p.first_ms,
                latest_ms: p.latest_ms.max(at_ms),
            },
            None => Pending {
                first_ms: at_ms,
                latest_ms: at_ms,
            },
        });
    }

    /// Instant at which the pending burst becomes due
    pub fn next_flush_ms(&self) -> Option<u64> {
        self.pending.map(|p| {
            let quiet = p.latest_ms.saturating_add(self.window_ms);
            let capped = p.first_ms.saturating_add(self.max_wait_ms);
            quiet.min(capped)
        })
    }

    /// Take the timestamp to persist if the burst is due
    pub fn poll(&mut self, now_ms: u64, phase: LockPhase) -> Option<u64> {
        if phase.is_locked() {
            self.pending = None;
            return None;
        }
        match self.next_flush_ms() {
            Some(due) if now_ms >= due => self.pending.take().map(|p| p.latest_ms),
            _ => None,
        }
    }

    /// Take the burst in progress regardless of its deadline
    pub fn take_pending(&mut self, phase: LockPhase) -> Option<u64> {
        let pending = self.pending.take();
        if phase.is_locked() {
            return None;
        }
        pending.map(|p| p.latest_ms)
    }

    /// Drop any burst in progress
    pub fn discard(&mut self) {
        self.pending = None;
    }
}
