//! Vigil Core - Session soft lock and verification fallback engine
//!
//! This crate decides *when* a user must prove presence again and *how*:
//! - Activity tracking with a debounced, persisted last-active timestamp
//! - An inactivity lock state machine that fails closed across reloads
//! - Biometric-first verification with enrollment offer and secret-code fallback
//! - Per-context secret-code attempt limiting with a lockout window
//! - A transaction gate that attaches exactly one proof to a sensitive action

pub mod activity;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod gate;
pub mod limiter;
pub mod lock;
pub mod orchestrator;
pub mod providers;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use activity::{ActivitySignal, ActivityTracker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::VigilConfig;
pub use engine::SessionEngine;
pub use error::{Error, Result};
pub use flow::{BiometricStatus, CodeEntryState, FlowEvent, Notice, Screen};
pub use gate::{GateOutcome, GateScope, GateStep, TransactionGate};
pub use limiter::{AttemptError, AttemptLimiter, AttemptStatus, LockoutPolicy};
pub use lock::LockStateMachine;
pub use orchestrator::{Collaborators, EndReason, Orchestrator, Step};
pub use providers::{
    BiometricError, BiometricProvider, CodeServiceError, EnrollmentError, SecretCodeService,
    SideEffect, SideEffectError, TransactionError, TransactionService, Visibility,
};
pub use scheduler::{spawn_interval, Monitor, MonitorUpdate, SchedulerEvent};
pub use state::{LockPhase, PersistedState, SecurityState};
pub use store::{
    FileBackend, MemoryBackend, SecurityStore, SharedStore, StateBackend, StateChange,
};
pub use types::{
    Method, Proof, SecretCode, TransactionDetails, UserId, VerificationContext,
    VerificationToken,
};

/// Persisted record schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Default inactivity threshold before the session soft-locks (15 minutes)
pub const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 15 * 60;

/// Default interval between inactivity checks
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 15;

/// Default window collapsing bursts of activity into one write
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Consecutive invalid codes before a context is locked out
pub const DEFAULT_MAX_CODE_ATTEMPTS: u32 = 3;

/// Minimum secret code length
pub const MIN_CODE_LENGTH: usize = 4;

/// Maximum secret code length
pub const MAX_CODE_LENGTH: usize = 8;
