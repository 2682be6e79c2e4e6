//! Boundaries to platform and backend collaborators

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Proof, SecretCode, UserId, VerificationToken};

/// Failure of a platform biometric assertion
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BiometricError {
    #[error("Biometric verification is not supported on this device")]
    Unsupported,

    #[error("No biometric credential is enrolled")]
    NotEnrolled,

    #[error("Biometric prompt was dismissed")]
    Cancelled,

    #[error("Biometric verification failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrollmentError {
    #[error("Biometric enrollment failed: {0}")]
    Failed(String),
}

/// Failure reported by the secret-code verification service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeServiceError {
    #[error("Invalid code")]
    InvalidCode,

    #[error("Verification service error: {0}")]
    Service(String),
}

/// Failure reported by the downstream transaction service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Domain rejection; the message may name a code problem
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Transaction service error: {0}")]
    Service(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SideEffectError(pub String);

/// Platform biometric API (WebAuthn, Touch ID, Android BiometricPrompt, ...)
#[async_trait]
pub trait BiometricProvider: Send + Sync {
    /// Whether the platform can perform biometric verification at all
    fn is_supported(&self) -> bool;

    /// Whether `user` has at least one enrolled credential on this device
    fn has_enrollment(&self, user: &UserId) -> bool;

    /// Enroll a new device-bound credential
    async fn register(&self, label: &str) -> Result<(), EnrollmentError>;

    /// Prompt the user and return a verification token
    async fn authenticate(&self) -> Result<VerificationToken, BiometricError>;
}

/// Backend verifying the user's secret code
#[async_trait]
pub trait SecretCodeService: Send + Sync {
    /// Whether `user` has a secret code at all
    fn is_configured(&self, user: &UserId) -> bool;

    /// Check `code`; `context` lets the backend rate-limit independently
    async fn verify(&self, code: &SecretCode, context: &str) -> Result<(), CodeServiceError>;

    /// Create the user's secret code
    async fn setup(&self, code: &SecretCode) -> Result<(), CodeServiceError>;
}

/// Downstream executor of a gated action
#[async_trait]
pub trait TransactionService: Send + Sync {
    type Request: Send + Sync;
    type Receipt: Send;

    /// Execute `request` carrying exactly one proof of presence
    async fn execute(
        &self,
        request: &Self::Request,
        proof: &Proof,
    ) -> Result<Self::Receipt, TransactionError>;
}

/// Whether the application is currently foregrounded
pub trait Visibility: Send + Sync {
    fn is_visible(&self) -> bool;
}

/// Best-effort work triggered by a successful verification
#[async_trait]
pub trait SideEffect: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), SideEffectError>;
}

/// Run each effect on its own task. Failures are logged, never returned.
pub fn spawn_side_effects(effects: &[Arc<dyn SideEffect>]) {
    for effect in effects {
        let effect = effect.clone();
        tokio::spawn(async move {
            match effect.run().await {
                Ok(()) => debug!("Side effect {} completed", effect.name()),
                Err(e) => warn!("Side effect {} failed: {}", effect.name(), e),
            }
        });
    }
}
