//! Session engine
//!
//! Composes the monitor, the lock state machine and an unlock orchestrator.
//! A completed unlock is the only way the engine moves LOCKED -> ACTIVE.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::VigilConfig;
use crate::error::{Error, Result};
use crate::flow::{BiometricStatus, Screen};
use crate::gate::{GateScope, TransactionGate};
use crate::limiter::AttemptLimiter;
use crate::lock::LockStateMachine;
use crate::orchestrator::{Collaborators, EndReason, Orchestrator, Step};
use crate::providers::{spawn_side_effects, SideEffect, TransactionService};
use crate::scheduler::{spawn_interval, Monitor, SchedulerEvent};
use crate::store::{SecurityStore, StateBackend, StateChange};
use crate::types::VerificationContext;

pub struct SessionEngine {
    config: VigilConfig,
    parts: Collaborators,
    lock: LockStateMachine,
    limiter: AttemptLimiter,
    monitor: Mutex<Monitor>,
    unlock: Orchestrator,
    gates: GateScope,
    side_effects: Vec<Arc<dyn SideEffect>>,
}

impl SessionEngine {
    /// Rehydrate state from `backend` and wire the components together
    pub fn new(
        config: VigilConfig,
        backend: Arc<dyn StateBackend>,
        parts: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let store = SecurityStore::open(backend, clock.now_ms()).shared();
        let lock = LockStateMachine::new(store.clone(), clock.clone(), config.inactivity_threshold());
        let monitor = Monitor::new(lock.clone(), config.debounce(), clock.clone());
        let limiter = AttemptLimiter::new(
            store,
            parts.codes.clone(),
            config.lockout_policy(),
            clock.clone(),
        );
        let unlock = Orchestrator::new(parts.clone(), limiter.clone(), clock);

        Ok(Self {
            config,
            parts,
            lock,
            limiter,
            monitor: Mutex::new(monitor),
            unlock,
            gates: GateScope::new(),
            side_effects: Vec::new(),
        })
    }

    /// Best-effort work to run after every successful unlock
    pub fn with_side_effect(mut self, effect: Arc<dyn SideEffect>) -> Self {
        self.side_effects.push(effect);
        self
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn lock_state(&self) -> &LockStateMachine {
        &self.lock
    }

    pub fn limiter(&self) -> &AttemptLimiter {
        &self.limiter
    }

    pub async fn is_locked(&self) -> bool {
        self.lock.is_locked().await
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.lock.store().read().await.subscribe()
    }

    /// Screen of the open unlock challenge
    pub async fn current_screen(&self) -> Option<Screen> {
        self.unlock.current().await
    }

    /// Run the first check right away so a stale or locked record blocks
    /// before any protected UI is shown.
    pub async fn start(&self) -> Result<Option<Step>> {
        self.lock.check().await?;
        if self.lock.is_locked().await {
            return self.begin_unlock().await.map(Some);
        }
        Ok(None)
    }

    /// Produce periodic ticks for [`SessionEngine::run`]
    pub fn spawn_ticker(&self, tx: mpsc::Sender<SchedulerEvent>) -> JoinHandle<()> {
        spawn_interval(tx, self.config.check_interval())
    }

    /// Process one scheduler event; returns the screen to show when a
    /// challenge opens or advances.
    pub async fn handle(&self, event: SchedulerEvent) -> Result<Option<Step>> {
        let update = self.monitor.lock().await.handle(event).await?;
        if update.locked {
            return self.begin_unlock().await.map(Some);
        }

        if event == SchedulerEvent::Foregrounded && self.lock.is_locked().await {
            // Another window may have locked the shared store
            if self.unlock.has_session().await {
                let step = self.unlock.on_foreground().await?;
                return self.settle(step).await.map(Some);
            }
            return self.begin_unlock().await.map(Some);
        }

        if event == SchedulerEvent::Tick && self.prompt_deferred().await {
            // A transaction prompt held the platform API when the lock fired
            let step = self.unlock.on_foreground().await?;
            return self.settle(step).await.map(Some);
        }
        Ok(None)
    }

    async fn prompt_deferred(&self) -> bool {
        self.parts.visibility.is_visible()
            && matches!(
                self.unlock.current().await,
                Some(Screen::Biometric(BiometricStatus::AwaitingForeground))
            )
    }

    /// Consume events until the sender closes, forwarding steps to the UI
    pub async fn run(&self, mut events: mpsc::Receiver<SchedulerEvent>, steps: mpsc::Sender<Step>) {
        while let Some(event) = events.recv().await {
            match self.handle(event).await {
                Ok(Some(step)) => {
                    if steps.send(step).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to handle {:?}: {}", event, e),
            }
        }
    }

    /// Open the unlock challenge. Only valid while locked.
    pub async fn begin_unlock(&self) -> Result<Step> {
        if !self.lock.is_locked().await {
            return Err(Error::InvalidTransition(
                "unlock requested while the session is active".to_string(),
            ));
        }
        let step = self.unlock.begin(VerificationContext::Unlock).await?;
        self.settle(step).await
    }

    pub async fn accept_enrollment(&self) -> Result<Step> {
        let step = self.unlock.accept_enrollment().await?;
        self.settle(step).await
    }

    pub async fn decline_enrollment(&self) -> Result<Step> {
        let step = self.unlock.decline_enrollment().await?;
        self.settle(step).await
    }

    pub async fn retry_biometric(&self) -> Result<Step> {
        let step = self.unlock.retry_biometric().await?;
        self.settle(step).await
    }

    pub async fn submit_code(&self, input: &str) -> Result<Step> {
        let step = self.unlock.submit_code(input).await?;
        self.settle(step).await
    }

    /// Dismiss the unlock challenge; the session stays locked
    pub async fn cancel_unlock(&self) -> bool {
        self.unlock.close().await
    }

    /// Tear down everything the current user left behind, including any
    /// transaction gate still open.
    pub async fn logout(&self) -> Result<()> {
        self.unlock.close().await;
        self.gates.end();
        self.monitor.lock().await.discard_pending();
        self.lock.clear().await?;
        info!("Security state cleared for logout of {}", self.parts.user);
        Ok(())
    }

    /// Gate for sensitive actions, sharing this engine's counters and its
    /// biometric prompt. The gate stops working at [`SessionEngine::logout`].
    pub fn transaction_gate<S: TransactionService>(&self, service: Arc<S>) -> TransactionGate<S> {
        TransactionGate::new(
            self.unlock.sibling(),
            service,
            self.config.code_error_patterns.clone(),
        )
        .within(self.gates.clone())
    }

    async fn settle(&self, step: Step) -> Result<Step> {
        match &step {
            Step::Verified(proof) => {
                self.lock.complete_verification().await?;
                info!("Unlocked with {:?} proof", proof.method());
                spawn_side_effects(&self.side_effects);
            }
            Step::Ended(EndReason::NoMethodAvailable) => {
                warn!("Unlock impossible for {}: no verification method", self.parts.user);
            }
            Step::Ended(EndReason::Cancelled) | Step::Show(_) => {}
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivitySignal;
    use crate::clock::ManualClock;
    use crate::gate::{GateOutcome, GateStep};
    use crate::mock::{
        MockBiometric, MockCodeService, MockTransactionService, MockVisibility,
        RecordingSideEffect,
    };
    use crate::state::LockPhase;
    use crate::store::MemoryBackend;
    use crate::types::{Proof, TransactionDetails, UserId};
    use std::time::Duration;

    fn engine(clock: &ManualClock, backend: &MemoryBackend, biometric: MockBiometric) -> SessionEngine {
        engine_with(clock, backend, biometric, MockCodeService::new("4821"))
    }

    fn engine_with(
        clock: &ManualClock,
        backend: &MemoryBackend,
        biometric: MockBiometric,
        codes: MockCodeService,
    ) -> SessionEngine {
        let parts = Collaborators {
            user: UserId::new("user-1"),
            biometric: Arc::new(biometric),
            codes: Arc::new(codes),
            visibility: Arc::new(MockVisibility::new(true)),
        };
        SessionEngine::new(
            VigilConfig::with_lockout_window(Duration::from_secs(120)),
            Arc::new(backend.clone()),
            parts,
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_idle_tick_opens_unlock_challenge() {
        let clock = ManualClock::new(0);
        let e = engine(&clock, &MemoryBackend::new(), MockBiometric::unsupported());
        assert!(e.start().await.unwrap().is_none());

        clock.advance_secs(15 * 60 + 1);
        let step = e.handle(SchedulerEvent::Tick).await.unwrap();
        assert!(matches!(step, Some(Step::Show(Screen::CodeEntry(_)))));
        assert!(e.is_locked().await);

        assert!(e.handle(SchedulerEvent::Tick).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_code_unlock_resets_last_active() {
        let clock = ManualClock::new(0);
        let e = engine(&clock, &MemoryBackend::new(), MockBiometric::unsupported());
        clock.advance_secs(3600);
        e.handle(SchedulerEvent::Tick).await.unwrap();

        clock.advance_secs(5);
        let step = e.submit_code("4821").await.unwrap();
        assert!(matches!(step, Step::Verified(_)));
        assert!(!e.is_locked().await);
        assert_eq!(e.lock_state().last_active_ms().await, clock.now_ms());
    }

    #[tokio::test]
    async fn test_activity_while_locked_is_ignored() {
        let clock = ManualClock::new(0);
        let e = engine(&clock, &MemoryBackend::new(), MockBiometric::unsupported());
        clock.advance_secs(901);
        e.handle(SchedulerEvent::Tick).await.unwrap();

        for _ in 0..5 {
            clock.advance_ms(600);
            e.handle(SchedulerEvent::Activity(ActivitySignal::Pointer))
                .await
                .unwrap();
        }
        assert!(e.is_locked().await);
        assert_eq!(e.lock_state().last_active_ms().await, 0);
    }

    #[tokio::test]
    async fn test_reload_while_locked_starts_locked() {
        let clock = ManualClock::new(0);
        let backend = MemoryBackend::new();
        {
            let e = engine(&clock, &backend, MockBiometric::unsupported());
            clock.advance_secs(901);
            e.handle(SchedulerEvent::Tick).await.unwrap();
        }

        let reloaded = engine(&clock, &backend, MockBiometric::unsupported());
        assert!(reloaded.is_locked().await);
        let step = reloaded.start().await.unwrap();
        assert!(matches!(step, Some(Step::Show(Screen::CodeEntry(_)))));
    }

    #[tokio::test]
    async fn test_foreground_adopts_lock_from_other_window() {
        let clock = ManualClock::new(0);
        let backend = MemoryBackend::new();
        let first = engine(&clock, &backend, MockBiometric::unsupported());
        let second = engine(&clock, &backend, MockBiometric::unsupported());

        clock.advance_secs(901);
        first.handle(SchedulerEvent::Tick).await.unwrap();
        assert!(!second.is_locked().await);

        let step = second.handle(SchedulerEvent::Foregrounded).await.unwrap();
        assert!(second.is_locked().await);
        assert!(matches!(step, Some(Step::Show(Screen::CodeEntry(_)))));
    }

    #[tokio::test]
    async fn test_biometric_unlock_runs_side_effects() {
        let clock = ManualClock::new(0);
        let effect = RecordingSideEffect::failing("session-bookkeeping");
        let e = engine(&clock, &MemoryBackend::new(), MockBiometric::enrolled())
            .with_side_effect(Arc::new(effect.clone()));

        clock.advance_secs(901);
        let step = e.handle(SchedulerEvent::Tick).await.unwrap();
        assert!(matches!(step, Some(Step::Verified(_))));

        effect.finished().await;
        assert_eq!(effect.runs(), 1);
        assert!(!e.is_locked().await);
    }

    #[tokio::test]
    async fn test_logout_clears_state() {
        let clock = ManualClock::new(0);
        let backend = MemoryBackend::new();
        let e = engine(&clock, &backend, MockBiometric::unsupported());
        clock.advance_secs(901);
        e.handle(SchedulerEvent::Tick).await.unwrap();
        e.submit_code("0000").await.unwrap();

        e.logout().await.unwrap();
        assert!(!e.is_locked().await);
        assert!(e.current_screen().await.is_none());
        assert_eq!(e.limiter().status("unlock").await.failed, 0);
        assert!(backend.snapshot().is_none());

        let next_user = engine(&clock, &backend, MockBiometric::unsupported());
        assert_eq!(next_user.lock_state().phase().await, LockPhase::Active);
        assert_eq!(next_user.limiter().status("unlock").await.failed, 0);
    }

    #[tokio::test]
    async fn test_unlock_requires_lock() {
        let clock = ManualClock::new(0);
        let e = engine(&clock, &MemoryBackend::new(), MockBiometric::unsupported());
        assert!(matches!(
            e.begin_unlock().await,
            Err(Error::InvalidTransition(_))
        ));
    }

    fn transfer() -> TransactionDetails {
        TransactionDetails::new(1250, "EUR", "alice")
    }

    #[tokio::test]
    async fn test_concurrent_unlock_codes_cannot_exceed_limit() {
        let clock = ManualClock::new(0);
        let codes = MockCodeService::new("4821");
        codes.respond_after(Duration::from_millis(20));
        let e = Arc::new(engine_with(
            &clock,
            &MemoryBackend::new(),
            MockBiometric::unsupported(),
            codes.clone(),
        ));
        clock.advance_secs(901);
        e.handle(SchedulerEvent::Tick).await.unwrap();

        for _ in 0..4 {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    let e = e.clone();
                    tokio::spawn(async move { e.submit_code("0000").await })
                })
                .collect();
            for handle in handles {
                assert!(matches!(
                    handle.await.unwrap().unwrap(),
                    Step::Show(Screen::CodeEntry(_))
                ));
            }
        }

        assert_eq!(codes.verify_calls(), 3);
        let status = e.limiter().status("unlock").await;
        assert_eq!(status.failed, 3);
        assert!(status.locked_until.is_some());
        assert!(e.is_locked().await);
    }

    #[tokio::test]
    async fn test_unlock_waits_for_transaction_prompt() {
        let clock = ManualClock::new(0);
        let biometric = MockBiometric::enrolled();
        biometric.hold_prompts();
        let e = engine(&clock, &MemoryBackend::new(), biometric.clone());
        let service = MockTransactionService::new();
        let gate = Arc::new(e.transaction_gate(Arc::new(service.clone())));

        let pending = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.begin(transfer(), transfer()).await })
        };
        while biometric.authenticate_calls() == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance_secs(901);
        let step = e.handle(SchedulerEvent::Tick).await.unwrap();
        assert_eq!(
            step,
            Some(Step::Show(Screen::Biometric(BiometricStatus::AwaitingForeground)))
        );
        assert_eq!(biometric.authenticate_calls(), 1);

        biometric.release_prompts();
        assert!(matches!(
            pending.await.unwrap().unwrap(),
            GateStep::Completed(GateOutcome::Executed(_))
        ));

        let step = e.handle(SchedulerEvent::Tick).await.unwrap();
        assert!(matches!(step, Some(Step::Verified(Proof::Token(_)))));
        assert!(!e.is_locked().await);
        assert_eq!(biometric.authenticate_calls(), 2);
        assert_eq!(biometric.max_open_prompts(), 1);
    }

    #[tokio::test]
    async fn test_logout_ends_open_gates() {
        let clock = ManualClock::new(0);
        let e = engine(&clock, &MemoryBackend::new(), MockBiometric::unsupported());
        let service = MockTransactionService::new();
        let gate = e.transaction_gate(Arc::new(service.clone()));

        let step = gate.begin(transfer(), transfer()).await.unwrap();
        assert!(matches!(step, GateStep::Show(Screen::CodeEntry(_))));

        e.logout().await.unwrap();
        assert!(matches!(gate.submit_code("4821").await, Err(Error::LoggedOut)));
        assert!(gate.current().await.is_none());
        assert!(service.proofs().is_empty());

        let fresh = e.transaction_gate(Arc::new(service.clone()));
        assert!(matches!(
            fresh.begin(transfer(), transfer()).await,
            Ok(GateStep::Show(Screen::CodeEntry(_)))
        ));
    }

    #[tokio::test]
    async fn test_prompt_finishing_after_logout_does_not_execute() {
        let clock = ManualClock::new(0);
        let biometric = MockBiometric::enrolled();
        biometric.hold_prompts();
        let e = engine(&clock, &MemoryBackend::new(), biometric.clone());
        let service = MockTransactionService::new();
        let gate = Arc::new(e.transaction_gate(Arc::new(service.clone())));

        let pending = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.begin(transfer(), transfer()).await })
        };
        while biometric.authenticate_calls() == 0 {
            tokio::task::yield_now().await;
        }

        e.logout().await.unwrap();
        biometric.release_prompts();
        assert_eq!(
            pending.await.unwrap().unwrap(),
            GateStep::Completed(GateOutcome::Ended(EndReason::Cancelled))
        );
        assert!(service.proofs().is_empty());
    }
}
