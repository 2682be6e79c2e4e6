//! Security state and its persisted schema
//!
//! [`SecurityState`] only changes through named transitions so the lock
//! invariants cannot be bypassed by field writes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::SCHEMA_VERSION;

/// Current session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockPhase {
    Active,
    Locked,
}

impl LockPhase {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockPhase::Locked)
    }
}

/// On-disk record, versioned for migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub schema_version: u32,
    pub lock_phase: LockPhase,
    /// Unix epoch milliseconds
    pub last_active_ms: u64,
    #[serde(default)]
    pub failed_attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub locked_until: BTreeMap<String, u64>,
    /// Bumped each time a context's counters are cleared
    #[serde(default)]
    pub attempt_epochs: BTreeMap<String, u64>,
}

impl PersistedState {
    /// Decode a stored record, rejecting versions this build does not understand
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Storage("record has no schema_version".to_string()))?;

        match version as u32 {
            SCHEMA_VERSION => Ok(serde_json::from_value(value)?),
            other => Err(Error::Storage(format!(
                "unsupported schema version {} (expected {})",
                other, SCHEMA_VERSION
            ))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Process-wide security state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityState {
    phase: LockPhase,
    last_active_ms: u64,
    failed_attempts: BTreeMap<String, u32>,
    locked_until: BTreeMap<String, u64>,
    attempt_epochs: BTreeMap<String, u64>,
}

impl SecurityState {
    /// Initial state at application start when nothing was persisted
    pub fn fresh(now_ms: u64) -> Self {
        Self {
            phase: LockPhase::Active,
            last_active_ms: now_ms,
            failed_attempts: BTreeMap::new(),
            locked_until: BTreeMap::new(),
            attempt_epochs: BTreeMap::new(),
        }
    }

    /// State used when a persisted record exists but cannot be trusted
    pub fn fail_closed(now_ms: u64) -> Self {
        Self {
            phase: LockPhase::Locked,
            ..Self::fresh(now_ms)
        }
    }

    pub fn from_persisted(record: PersistedState) -> Self {
        Self {
            phase: record.lock_phase,
            last_active_ms: record.last_active_ms,
            failed_attempts: record.failed_attempts,
            locked_until: record.locked_until,
            attempt_epochs: record.attempt_epochs,
        }
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            schema_version: SCHEMA_VERSION,
            lock_phase: self.phase,
            last_active_ms: self.last_active_ms,
            failed_attempts: self.failed_attempts.clone(),
            locked_until: self.locked_until.clone(),
            attempt_epochs: self.attempt_epochs.clone(),
        }
    }

    pub fn phase(&self) -> LockPhase {
        self.phase
    }

    pub fn is_locked(&self) -> bool {
        self.phase.is_locked()
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms
    }

    pub fn failed_attempts(&self, context: &str) -> u32 {
        self.failed_attempts.get(context).copied().unwrap_or(0)
    }

    pub fn locked_until(&self, context: &str) -> Option<u64> {
        self.locked_until.get(context).copied()
    }

    /// How many times the counters for `context` have been cleared
    pub fn attempt_epoch(&self, context: &str) -> u64 {
        self.attempt_epochs.get(context).copied().unwrap_or(0)
    }

    /// Whether more than `threshold_ms` has elapsed since the last activity
    pub fn is_inactive(&self, now_ms: u64, threshold_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_active_ms) > threshold_ms
    }

    // ---- phase transitions ----

    /// ACTIVE -> LOCKED. Returns false if already locked.
    pub fn lock(&mut self) -> bool {
        if self.phase.is_locked() {
            return false;
        }
        self.phase = LockPhase::Locked;
        true
    }

    /// LOCKED -> ACTIVE after a successful verification; resets the activity clock.
    pub fn unlock(&mut self, now_ms: u64) -> bool {
        let was_locked = self.phase.is_locked();
        self.phase = LockPhase::Active;
        self.last_active_ms = self.last_active_ms.max(now_ms);
        was_locked
    }

    /// Record user activity. Ignored while locked and never moves time backwards.
    pub fn record_activity(&mut self, at_ms: u64) -> bool {
        if self.phase.is_locked() || at_ms <= self.last_active_ms {
            return false;
        }
        self.last_active_ms = at_ms;
        true
    }

    // ---- attempt counters ----

    /// Count one more consecutive failure; returns the new count
    pub fn record_failure(&mut self, context: &str) -> u32 {
        let count = self.failed_attempts.entry(context.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn impose_lockout(&mut self, context: &str, until_ms: u64) {
        self.locked_until.insert(context.to_string(), until_ms);
    }

    /// Zero the counter and clear any lockout for `context`
    pub fn reset_attempts(&mut self, context: &str) {
        let had_failures = self.failed_attempts.remove(context).is_some();
        let had_lockout = self.locked_until.remove(context).is_some();
        if had_failures || had_lockout {
            let epoch = self.attempt_epochs.entry(context.to_string()).or_insert(0);
            *epoch = epoch.saturating_add(1);
        }
    }

    /// Combine with a state written by another window sharing the same store.
    ///
    /// LOCKED wins and timestamps take the later value. For each context the
    /// counters from the higher reset epoch win, so a window holding counters
    /// from before a successful verification cannot bring them back. At equal
    /// epochs the more restrictive counters are kept.
    pub fn merge(&self, other: &SecurityState) -> SecurityState {
        let phase = if self.is_locked() || other.is_locked() {
            LockPhase::Locked
        } else {
            LockPhase::Active
        };

        let contexts: BTreeSet<&String> = [self, other]
            .into_iter()
            .flat_map(|s| {
                s.failed_attempts
                    .keys()
                    .chain(s.locked_until.keys())
                    .chain(s.attempt_epochs.keys())
            })
            .collect();

        let mut failed_attempts = BTreeMap::new();
        let mut locked_until = BTreeMap::new();
        let mut attempt_epochs = BTreeMap::new();
        for ctx in contexts {
            let ours = self.attempt_epoch(ctx);
            let theirs = other.attempt_epoch(ctx);
            let (failed, until) = match ours.cmp(&theirs) {
                Ordering::Greater => (self.failed_attempts.get(ctx), self.locked_until(ctx)),
                Ordering::Less => (other.failed_attempts.get(ctx), other.locked_until(ctx)),
                Ordering::Equal => (
                    self.failed_attempts.get(ctx).max(other.failed_attempts.get(ctx)),
                    self.locked_until(ctx).max(other.locked_until(ctx)),
                ),
            };
            if let Some(&count) = failed {
                failed_attempts.insert(ctx.clone(), count);
            }
            if let Some(until) = until {
                locked_until.insert(ctx.clone(), until);
            }
            if ours.max(theirs) > 0 {
                attempt_epochs.insert(ctx.clone(), ours.max(theirs));
            }
        }

        SecurityState {
            phase,
            last_active_ms: self.last_active_ms.max(other.last_active_ms),
            failed_attempts,
            locked_until,
            attempt_epochs,
        }
    }
}
