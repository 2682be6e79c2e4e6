//! Inactivity lock state machine
//!
//! ACTIVE -> LOCKED when a check finds the session idle past the threshold.
//! LOCKED -> ACTIVE only through [`LockStateMachine::complete_verification`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::state::LockPhase;
use crate::store::SharedStore;

#[derive(Clone)]
pub struct LockStateMachine {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    threshold_ms: u64,
}

impl LockStateMachine {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, threshold: Duration) -> Self {
        Self {
            store,
            clock,
            threshold_ms: threshold.as_millis() as u64,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub async fn phase(&self) -> LockPhase {
        self.store.read().await.state().phase()
    }

    pub async fn is_locked(&self) -> bool {
        self.phase().await.is_locked()
    }

    pub async fn last_active_ms(&self) -> u64 {
        self.store.read().await.state().last_active_ms()
    }

    /// Evaluate inactivity. Returns true only on the ACTIVE -> LOCKED edge.
    pub async fn check(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut store = self.store.write().await;
        let state = store.state();
        if state.is_locked() || !state.is_inactive(now, self.threshold_ms) {
            return Ok(false);
        }

        let idle_secs = now.saturating_sub(state.last_active_ms()) / 1000;
        let locked = store.lock()?;
        if locked {
            info!("Session locked after {}s of inactivity", idle_secs);
        }
        Ok(locked)
    }

    /// Persist a debounced activity timestamp. No effect while locked.
    pub async fn record_activity(&self, at_ms: u64) -> Result<bool> {
        let recorded = self.store.write().await.record_activity(at_ms)?;
        if recorded {
            debug!("Recorded activity at {}", at_ms);
        }
        Ok(recorded)
    }

    /// App came to the foreground: adopt changes from other windows, then check.
    pub async fn on_foreground(&self) -> Result<bool> {
        self.store.write().await.refresh()?;
        self.check().await
    }

    /// The only path from LOCKED back to ACTIVE
    pub async fn complete_verification(&self) -> Result<()> {
        let now = self.clock.now_ms();
        if self.store.write().await.unlock(now)? {
            info!("Session unlocked");
        }
        Ok(())
    }

    /// Logout: forget everything so the next user inherits nothing
    pub async fn clear(&self) -> Result<()> {
        let now = self.clock.now_ms();
        self.store.write().await.clear(now)
    }
}
