//! Transaction verification gate
//!
//! Wraps a sensitive action with a `transaction` challenge and hands the
//! resulting proof to the [`TransactionService`]. Only rejections that blame
//! the attached code reach the attempt limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::flow::Screen;
use crate::limiter::AttemptLimiter;
use crate::orchestrator::{EndReason, Orchestrator, Step};
use crate::providers::{spawn_side_effects, SideEffect, TransactionError, TransactionService};
use crate::types::{Proof, TransactionDetails, VerificationContext};

/// Terminal result of a gated action
#[derive(Debug, PartialEq, Eq)]
pub enum GateOutcome<R> {
    /// The action ran with exactly one proof attached
    Executed(R),
    /// The action itself failed; attempt counters were not touched
    Failed(TransactionError),
    /// Verification ended without a proof; the action never ran
    Ended(EndReason),
}

#[derive(Debug, PartialEq, Eq)]
pub enum GateStep<R> {
    Show(Screen),
    Completed(GateOutcome<R>),
}

/// Lifetime of the gates handed out for one signed-in user
#[derive(Debug, Clone, Default)]
pub struct GateScope {
    generation: Arc<AtomicU64>,
}

impl GateScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every gate created in this scope so far
    pub fn end(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

struct PendingAction<Req> {
    details: TransactionDetails,
    request: Req,
}

pub struct TransactionGate<S: TransactionService> {
    orchestrator: Orchestrator,
    limiter: AttemptLimiter,
    service: Arc<S>,
    code_error_patterns: Vec<String>,
    side_effects: Vec<Arc<dyn SideEffect>>,
    pending: Mutex<Option<PendingAction<S::Request>>>,
    scope: GateScope,
    generation: u64,
}

impl<S: TransactionService> TransactionGate<S> {
    pub fn new(orchestrator: Orchestrator, service: Arc<S>, code_error_patterns: Vec<String>) -> Self {
        let limiter = orchestrator.limiter().clone();
        Self {
            orchestrator,
            limiter,
            service,
            code_error_patterns: code_error_patterns
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
            side_effects: Vec::new(),
            pending: Mutex::new(None),
            scope: GateScope::new(),
            generation: 0,
        }
    }

    /// Tie the gate to `scope`; once the scope ends the gate refuses all work
    pub fn within(mut self, scope: GateScope) -> Self {
        self.generation = scope.current();
        self.scope = scope;
        self
    }

    pub fn is_revoked(&self) -> bool {
        self.scope.current() != self.generation
    }

    /// Best-effort work to run after the action succeeds
    pub fn with_side_effect(mut self, effect: Arc<dyn SideEffect>) -> Self {
        self.side_effects.push(effect);
        self
    }

    pub async fn current(&self) -> Option<Screen> {
        self.orchestrator.current().await
    }

    /// Start verification for `request`, described to the user by `details`
    pub async fn begin(
        &self,
        details: TransactionDetails,
        request: S::Request,
    ) -> Result<GateStep<S::Receipt>> {
        self.ensure_open().await?;
        {
            let mut pending = self.pending.lock().await;
            if pending.is_some() {
                return Err(Error::SessionInProgress);
            }
            *pending = Some(PendingAction {
                details: details.clone(),
                request,
            });
        }
        info!("Verifying transaction: {}", details.summary());

        match self
            .orchestrator
            .begin(VerificationContext::Transaction(details))
            .await
        {
            Ok(step) => self.advance(step).await,
            Err(e) => {
                self.pending.lock().await.take();
                Err(e)
            }
        }
    }

    pub async fn accept_enrollment(&self) -> Result<GateStep<S::Receipt>> {
        self.ensure_open().await?;
        let step = self.orchestrator.accept_enrollment().await?;
        self.advance(step).await
    }

    pub async fn decline_enrollment(&self) -> Result<GateStep<S::Receipt>> {
        self.ensure_open().await?;
        let step = self.orchestrator.decline_enrollment().await?;
        self.advance(step).await
    }

    pub async fn retry_biometric(&self) -> Result<GateStep<S::Receipt>> {
        self.ensure_open().await?;
        let step = self.orchestrator.retry_biometric().await?;
        self.advance(step).await
    }

    pub async fn on_foreground(&self) -> Result<GateStep<S::Receipt>> {
        self.ensure_open().await?;
        let step = self.orchestrator.on_foreground().await?;
        self.advance(step).await
    }

    pub async fn submit_code(&self, input: &str) -> Result<GateStep<S::Receipt>> {
        self.ensure_open().await?;
        let step = self.orchestrator.submit_code(input).await?;
        self.advance(step).await
    }

    pub async fn submit_setup(&self, input: &str) -> Result<GateStep<S::Receipt>> {
        self.ensure_open().await?;
        let step = self.orchestrator.submit_setup(input).await?;
        self.advance(step).await
    }

    /// Abandon the action. Attempt counters are left as they are.
    pub async fn close(&self) -> bool {
        let closed = self.orchestrator.close().await;
        self.pending.lock().await.take().is_some() || closed
    }

    /// Drop whatever a logged-out user left in this gate
    async fn ensure_open(&self) -> Result<()> {
        if !self.is_revoked() {
            return Ok(());
        }
        if self.close().await {
            info!("Discarded transaction verification left open at logout");
        }
        Err(Error::LoggedOut)
    }

    async fn advance(&self, step: Step) -> Result<GateStep<S::Receipt>> {
        match step {
            Step::Show(screen) => Ok(GateStep::Show(screen)),
            Step::Verified(proof) => self.execute(proof).await,
            Step::Ended(reason) => {
                self.pending.lock().await.take();
                Ok(GateStep::Completed(GateOutcome::Ended(reason)))
            }
        }
    }

    async fn execute(&self, proof: Proof) -> Result<GateStep<S::Receipt>> {
        let mut pending = self.pending.lock().await;
        if self.is_revoked() {
            warn!("Verification finished after logout, transaction not executed");
            pending.take();
            return Ok(GateStep::Completed(GateOutcome::Ended(EndReason::Cancelled)));
        }
        let action = pending.as_ref().ok_or(Error::NoActiveSession)?;

        match self.service.execute(&action.request, &proof).await {
            Ok(receipt) => {
                info!(
                    "Transaction executed with {:?} proof: {}",
                    proof.method(),
                    action.details.summary()
                );
                pending.take();
                spawn_side_effects(&self.side_effects);
                Ok(GateStep::Completed(GateOutcome::Executed(receipt)))
            }
            Err(TransactionError::Rejected(msg))
                if matches!(proof, Proof::Code(_)) && self.blames_code(&msg) =>
            {
                warn!("Transaction rejected the attached code: {}", msg);
                let context = VerificationContext::Transaction(action.details.clone());
                let outcome = self.limiter.record_rejection(context.key()).await?;
                let screen = self.orchestrator.reopen_code_entry(context, &outcome).await?;
                Ok(GateStep::Show(screen))
            }
            Err(e) => {
                warn!("{}", e);
                pending.take();
                Ok(GateStep::Completed(GateOutcome::Failed(e)))
            }
        }
    }

    fn blames_code(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.code_error_patterns
            .iter()
            .any(|pattern| message.contains(pattern.as_str()))
    }
}
