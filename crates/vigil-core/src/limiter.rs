//! Secret-code attempt limiting
//!
//! Rejects codes client-side while a context is locked out and counts
//! backend-confirmed invalid codes per verification context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::providers::{CodeServiceError, SecretCodeService};
use crate::store::SharedStore;
use crate::types::SecretCode;

/// Lockout policy for failed code attempts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Consecutive failures that trigger a lockout
    max_attempts: u32,
    /// How long input stays disabled once triggered
    window: Duration,
}

impl LockoutPolicy {
    /// The window has no built-in value; it is deployment policy.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Lockout duration to impose after `failed_attempts`, if any
    pub fn lockout_duration(&self, failed_attempts: u32) -> Option<Duration> {
        (failed_attempts >= self.max_attempts).then_some(self.window)
    }

    pub fn attempts_remaining(&self, failed_attempts: u32) -> u32 {
        self.max_attempts.saturating_sub(failed_attempts)
    }

    /// Human-readable lockout length
    pub fn lockout_description(&self) -> String {
        let secs = self.window.as_secs();
        if secs < 60 {
            format!("{} seconds", secs)
        } else if secs < 3600 {
            format!("{} minutes", secs / 60)
        } else {
            format!("{} hours", secs / 3600)
        }
    }
}

/// Why an attempt did not succeed
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Context is locked out; the service was not called
    #[error("Too many invalid codes; locked until {until_ms}")]
    RateLimited { until_ms: u64 },

    #[error("Invalid code, {remaining} attempts remaining")]
    InvalidCode { remaining: u32 },

    /// This attempt hit the maximum and started a lockout
    #[error("Invalid code; locked until {until_ms}")]
    LockedOut { until_ms: u64 },

    /// Network or backend failure; counters untouched
    #[error("Verification service error: {0}")]
    Service(String),

    #[error(transparent)]
    Store(#[from] crate::Error),
}

/// Snapshot of one context's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStatus {
    pub failed: u32,
    pub remaining: u32,
    /// Set only while the lockout is still in the future
    pub locked_until: Option<u64>,
}

/// One async lock per context key, shared by every clone of a limiter
type ContextLocks = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone)]
pub struct AttemptLimiter {
    store: SharedStore,
    service: Arc<dyn SecretCodeService>,
    policy: LockoutPolicy,
    clock: Arc<dyn Clock>,
    in_flight: ContextLocks,
}

impl AttemptLimiter {
    pub fn new(
        store: SharedStore,
        service: Arc<dyn SecretCodeService>,
        policy: LockoutPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            service,
            policy,
            clock,
            in_flight: Arc::default(),
        }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    pub async fn status(&self, context: &str) -> AttemptStatus {
        let now = self.clock.now_ms();
        let store = self.store.read().await;
        let failed = store.state().failed_attempts(context);
        AttemptStatus {
            failed,
            remaining: self.policy.attempts_remaining(failed),
            locked_until: store.state().locked_until(context).filter(|&u| now < u),
        }
    }

    /// Verify `code` for `context`, enforcing the lockout before any network call.
    ///
    /// Attempts for one context run one at a time from the lockout check to
    /// the counter update, so concurrent callers see each other's failures.
    pub async fn attempt(&self, context: &str, code: &SecretCode) -> Result<(), AttemptError> {
        let _serial = self.serialize(context).await?;
        self.ensure_not_locked_out(context).await?;

        match self.service.verify(code, context).await {
            Ok(()) => {
                self.record_success(context).await?;
                Ok(())
            }
            Err(CodeServiceError::InvalidCode) => Err(self.record_rejection(context).await?),
            Err(CodeServiceError::Service(msg)) => {
                warn!("Code verification unavailable for {}: {}", context, msg);
                Err(AttemptError::Service(msg))
            }
        }
    }

    async fn serialize(&self, context: &str) -> Result<OwnedMutexGuard<()>, AttemptError> {
        let lock = {
            let mut locks = self
                .in_flight
                .lock()
                .map_err(|_| crate::Error::Storage("attempt lock poisoned".to_string()))?;
            locks.entry(context.to_string()).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }

    /// Client-side gate; an elapsed lockout starts a fresh counter
    pub async fn ensure_not_locked_out(&self, context: &str) -> Result<(), AttemptError> {
        let now = self.clock.now_ms();
        let mut store = self.store.write().await;
        match store.state().locked_until(context) {
            Some(until_ms) if now < until_ms => {
                warn!("Code attempt for {} rejected: locked until {}", context, until_ms);
                Err(AttemptError::RateLimited { until_ms })
            }
            Some(_) => {
                info!("Lockout for {} elapsed, resetting attempts", context);
                store.reset_attempts(context)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Count a confirmed invalid code; returns the error to surface
    pub async fn record_rejection(&self, context: &str) -> Result<AttemptError, crate::Error> {
        let now = self.clock.now_ms();
        let mut store = self.store.write().await;
        let failed = store.record_failure(context)?;

        match self.policy.lockout_duration(failed) {
            Some(duration) => {
                let until_ms = now.saturating_add(duration.as_millis() as u64);
                store.impose_lockout(context, until_ms)?;
                warn!(
                    "{} invalid codes for {}, input disabled for {}",
                    failed,
                    context,
                    self.policy.lockout_description()
                );
                Ok(AttemptError::LockedOut { until_ms })
            }
            None => Ok(AttemptError::InvalidCode {
                remaining: self.policy.attempts_remaining(failed),
            }),
        }
    }

    /// Any successful verification clears the context's counters
    pub async fn record_success(&self, context: &str) -> Result<(), crate::Error> {
        self.store.write().await.reset_attempts(context)
    }
}
