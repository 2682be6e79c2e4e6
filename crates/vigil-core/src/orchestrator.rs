//! Verification orchestrator
//!
//! Runs one challenge at a time: biometric first when the platform supports it
//! and the user is enrolled, an enrollment offer when they are not, and
//! secret-code entry as the fallback. Each challenge ends with exactly one
//! [`Proof`] or without success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::flow::{self, FlowEvent, Screen};
use crate::limiter::{AttemptError, AttemptLimiter};
use crate::providers::{BiometricError, BiometricProvider, SecretCodeService, Visibility};
use crate::types::{Method, Proof, SecretCode, UserId, VerificationContext};

/// Platform and backend collaborators shared by every challenge
#[derive(Clone)]
pub struct Collaborators {
    pub user: UserId,
    pub biometric: Arc<dyn BiometricProvider>,
    pub codes: Arc<dyn SecretCodeService>,
    pub visibility: Arc<dyn Visibility>,
}

/// Why a challenge ended without a proof
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The session was closed, or a result arrived after it was
    Cancelled,
    /// No biometric credential and no secret code to fall back to
    NoMethodAvailable,
}

/// Result of driving a challenge one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Show(Screen),
    Verified(Proof),
    Ended(EndReason),
}

/// Ephemeral state of one challenge
#[derive(Debug)]
struct VerificationSession {
    id: Uuid,
    context: VerificationContext,
    method: Method,
    screen: Screen,
}

type Slot = Option<VerificationSession>;

/// Holds the platform prompt. Releases it when the prompt finishes or its
/// future is dropped.
struct PromptGuard<'a> {
    shared: &'a AtomicBool,
    own: &'a AtomicBool,
}

impl<'a> PromptGuard<'a> {
    fn acquire(shared: &'a AtomicBool, own: &'a AtomicBool) -> Option<Self> {
        shared
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        own.store(true, Ordering::SeqCst);
        Some(Self { shared, own })
    }
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        self.own.store(false, Ordering::SeqCst);
        self.shared.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    parts: Collaborators,
    limiter: AttemptLimiter,
    clock: Arc<dyn Clock>,
    session: Mutex<Slot>,
    /// Set while any orchestrator sharing this flag has a prompt open
    prompt_open: Arc<AtomicBool>,
    /// Set while this orchestrator owns the open prompt
    prompting: AtomicBool,
}

impl Orchestrator {
    pub fn new(parts: Collaborators, limiter: AttemptLimiter, clock: Arc<dyn Clock>) -> Self {
        Self {
            parts,
            limiter,
            clock,
            session: Mutex::new(None),
            prompt_open: Arc::new(AtomicBool::new(false)),
            prompting: AtomicBool::new(false),
        }
    }

    /// Orchestrator over the same collaborators and counters with its own
    /// session. At most one platform prompt is open across the two.
    pub fn sibling(&self) -> Self {
        Self {
            parts: self.parts.clone(),
            limiter: self.limiter.clone(),
            clock: self.clock.clone(),
            session: Mutex::new(None),
            prompt_open: self.prompt_open.clone(),
            prompting: AtomicBool::new(false),
        }
    }

    pub fn limiter(&self) -> &AttemptLimiter {
        &self.limiter
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Screen of the open session
    pub async fn current(&self) -> Option<Screen> {
        self.session.lock().await.as_ref().map(|s| s.screen)
    }

    pub async fn context(&self) -> Option<VerificationContext> {
        self.session.lock().await.as_ref().map(|s| s.context.clone())
    }

    pub async fn method(&self) -> Option<Method> {
        self.session.lock().await.as_ref().map(|s| s.method)
    }

    /// Open a challenge for `context` and run it up to the first user decision
    pub async fn begin(&self, context: VerificationContext) -> Result<Step> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(Error::SessionInProgress);
        }

        let supported = self.parts.biometric.is_supported();
        let enrolled = supported && self.parts.biometric.has_enrollment(&self.parts.user);
        let screen = flow::initial(supported, enrolled);
        let id = Uuid::new_v4();
        info!(
            "Verification session {} for {} (biometric supported: {}, enrolled: {})",
            id, context, supported, enrolled
        );

        *slot = Some(VerificationSession {
            id,
            context,
            method: Method::Unset,
            screen,
        });

        match screen {
            Screen::Biometric(_) => self.run_biometric(slot).await,
            Screen::CodeEntry(_) => self.settle_code_entry(&mut slot).await,
            other => Ok(Step::Show(other)),
        }
    }

    /// Enroll a credential, then prompt with it right away
    pub async fn accept_enrollment(&self) -> Result<Step> {
        let slot = self.session.lock().await;
        let id = expect_screen(&slot, |s| matches!(s, Screen::EnrollmentOffer))?;
        drop(slot);

        let label = format!("{} on this device", self.parts.user);
        let registered = self.parts.biometric.register(&label).await;

        let mut slot = self.session.lock().await;
        if !is_current(&slot, id) {
            debug!("Discarding enrollment result for closed session {}", id);
            return Ok(Step::Ended(EndReason::Cancelled));
        }
        match registered {
            Ok(()) => {
                info!("Biometric credential enrolled for {}", self.parts.user);
                apply(&mut slot, FlowEvent::EnrollmentAccepted)?;
                self.run_biometric(slot).await
            }
            Err(e) => {
                warn!("{}", e);
                apply(&mut slot, FlowEvent::EnrollmentFailed)?;
                self.settle_code_entry(&mut slot).await
            }
        }
    }

    pub async fn decline_enrollment(&self) -> Result<Step> {
        let mut slot = self.session.lock().await;
        apply(&mut slot, FlowEvent::EnrollmentDeclined)?;
        self.settle_code_entry(&mut slot).await
    }

    /// Explicit user retry from the code screen
    pub async fn retry_biometric(&self) -> Result<Step> {
        let mut slot = self.session.lock().await;
        apply(&mut slot, FlowEvent::BiometricRetry)?;
        self.run_biometric(slot).await
    }

    /// The app is visible again: resume a deferred prompt
    pub async fn on_foreground(&self) -> Result<Step> {
        let mut slot = self.session.lock().await;
        let screen = slot
            .as_ref()
            .map(|s| s.screen)
            .ok_or(Error::NoActiveSession)?;
        match screen {
            Screen::Biometric(flow::BiometricStatus::AwaitingForeground) => {
                apply(&mut slot, FlowEvent::BiometricResumed)?;
                self.run_biometric(slot).await
            }
            Screen::Biometric(flow::BiometricStatus::Prompting) => self.run_biometric(slot).await,
            other => Ok(Step::Show(other)),
        }
    }

    /// Verify a code typed on the code entry screen
    pub async fn submit_code(&self, input: &str) -> Result<Step> {
        let mut slot = self.session.lock().await;
        let id = expect_screen(&slot, |s| matches!(s, Screen::CodeEntry(_)))?;
        let (key, entry) = match slot.as_ref() {
            Some(VerificationSession {
                context,
                screen: Screen::CodeEntry(entry),
                ..
            }) => (context.key(), *entry),
            _ => return Err(Error::NoActiveSession),
        };

        if entry.submitting {
            debug!("A code for {} is already being verified", key);
            return Ok(Step::Show(Screen::CodeEntry(entry)));
        }
        if entry.is_disabled(self.clock.now_ms()) {
            debug!("Code input for {} is disabled", key);
            return Ok(Step::Show(Screen::CodeEntry(entry)));
        }

        let code = match SecretCode::parse(input) {
            Ok(code) => code,
            Err(_) => return Ok(Step::Show(apply(&mut slot, FlowEvent::CodeMalformed)?)),
        };
        apply(&mut slot, FlowEvent::CodeSubmitted)?;
        drop(slot);

        let outcome = self.limiter.attempt(key, &code).await;

        let mut slot = self.session.lock().await;
        if !is_current(&slot, id) {
            debug!("Discarding code result for closed session {}", id);
            return Ok(Step::Ended(EndReason::Cancelled));
        }
        match outcome {
            Ok(()) => {
                info!("Secret code accepted for {}", key);
                slot.take();
                Ok(Step::Verified(Proof::Code(code)))
            }
            Err(e) => Ok(Step::Show(apply(&mut slot, attempt_event(&e))?)),
        }
    }

    /// Create a secret code on the setup screen; the new code is the proof
    pub async fn submit_setup(&self, input: &str) -> Result<Step> {
        let mut slot = self.session.lock().await;
        let id = expect_screen(&slot, |s| matches!(s, Screen::CodeSetup { .. }))?;

        let code = match SecretCode::parse(input) {
            Ok(code) => code,
            Err(_) => return Ok(Step::Show(apply(&mut slot, FlowEvent::CodeMalformed)?)),
        };
        drop(slot);

        let saved = self.parts.codes.setup(&code).await;

        let mut slot = self.session.lock().await;
        if !is_current(&slot, id) {
            debug!("Discarding setup result for closed session {}", id);
            return Ok(Step::Ended(EndReason::Cancelled));
        }
        match saved {
            Ok(()) => {
                info!("Secret code created for {}", self.parts.user);
                slot.take();
                Ok(Step::Verified(Proof::Code(code)))
            }
            Err(e) => {
                warn!("Secret code setup failed: {}", e);
                Ok(Step::Show(apply(&mut slot, FlowEvent::SetupFailed)?))
            }
        }
    }

    /// Discard the open session. Attempt counters are left as they are.
    pub async fn close(&self) -> bool {
        match self.session.lock().await.take() {
            Some(session) => {
                info!("Verification session {} for {} closed", session.id, session.context);
                true
            }
            None => false,
        }
    }

    /// Open a session directly on code entry after a downstream service
    /// rejected the code that was attached to it.
    pub(crate) async fn reopen_code_entry(
        &self,
        context: VerificationContext,
        outcome: &AttemptError,
    ) -> Result<Screen> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(Error::SessionInProgress);
        }
        let can_retry_biometric = self.parts.biometric.is_supported()
            && self.parts.biometric.has_enrollment(&self.parts.user);
        *slot = Some(VerificationSession {
            id: Uuid::new_v4(),
            context,
            method: Method::Code,
            screen: Screen::CodeEntry(flow::CodeEntryState {
                can_retry_biometric,
                ..Default::default()
            }),
        });
        apply(&mut slot, attempt_event(outcome))
    }

    async fn run_biometric(&self, mut slot: MutexGuard<'_, Slot>) -> Result<Step> {
        let id = match slot.as_mut() {
            Some(session) => {
                session.method = Method::Biometric;
                session.id
            }
            None => return Err(Error::NoActiveSession),
        };

        if !self.parts.visibility.is_visible() {
            debug!("App hidden, deferring biometric prompt for session {}", id);
            return Ok(Step::Show(apply(&mut slot, FlowEvent::BiometricDeferred)?));
        }

        let Some(prompt) = PromptGuard::acquire(&self.prompt_open, &self.prompting) else {
            if self.prompting.load(Ordering::SeqCst) {
                debug!("Biometric prompt already open");
                return Ok(Step::Show(screen_of(&slot)?));
            }
            debug!("Another challenge holds the biometric prompt, deferring session {}", id);
            return Ok(Step::Show(apply(&mut slot, FlowEvent::BiometricDeferred)?));
        };
        drop(slot);

        let result = self.parts.biometric.authenticate().await;
        drop(prompt);

        let mut slot = self.session.lock().await;
        if !is_current(&slot, id) {
            debug!("Discarding biometric result for closed session {}", id);
            return Ok(Step::Ended(EndReason::Cancelled));
        }

        match result {
            Ok(token) => {
                let key = slot
                    .as_ref()
                    .map(|s| s.context.key())
                    .ok_or(Error::NoActiveSession)?;
                if let Err(e) = self.limiter.record_success(key).await {
                    warn!("Failed to reset attempts for {}: {}", key, e);
                }
                info!("Biometric verification succeeded for {}", key);
                slot.take();
                Ok(Step::Verified(Proof::Token(token)))
            }
            Err(BiometricError::Cancelled) => {
                info!("Biometric prompt dismissed, falling back to code");
                apply(&mut slot, FlowEvent::BiometricCancelled)?;
                self.settle_code_entry(&mut slot).await
            }
            Err(e) => {
                warn!("{}, falling back to code", e);
                apply(&mut slot, FlowEvent::BiometricFailed)?;
                self.settle_code_entry(&mut slot).await
            }
        }
    }

    /// Finish entering code entry: route to setup when no code exists and
    /// disable input right away while the context is locked out.
    async fn settle_code_entry(&self, slot: &mut Slot) -> Result<Step> {
        let (id, context_is_unlock, key) = match slot.as_mut() {
            Some(session) => {
                session.method = Method::Code;
                (session.id, session.context.is_unlock(), session.context.key())
            }
            None => return Err(Error::NoActiveSession),
        };

        if !self.parts.codes.is_configured(&self.parts.user) {
            if context_is_unlock {
                warn!(
                    "No verification method available to unlock {}, ending session {}",
                    self.parts.user, id
                );
                slot.take();
                return Ok(Step::Ended(EndReason::NoMethodAvailable));
            }
            return Ok(Step::Show(apply(slot, FlowEvent::CodeSetupRequired)?));
        }

        if let Some(until_ms) = self.limiter.status(key).await.locked_until {
            return Ok(Step::Show(apply(
                slot,
                FlowEvent::CodeLockedOut { until_ms },
            )?));
        }
        Ok(Step::Show(screen_of(slot)?))
    }
}

fn apply(slot: &mut Slot, event: FlowEvent) -> Result<Screen> {
    let session = slot.as_mut().ok_or(Error::NoActiveSession)?;
    let next = flow::transition(&session.screen, event)?;
    debug!("Session {}: {:?} -> {:?}", session.id, session.screen, next);
    session.screen = next;
    Ok(next)
}

fn screen_of(slot: &Slot) -> Result<Screen> {
    slot.as_ref().map(|s| s.screen).ok_or(Error::NoActiveSession)
}

fn is_current(slot: &Slot, id: Uuid) -> bool {
    slot.as_ref().map(|s| s.id == id).unwrap_or(false)
}

fn expect_screen(slot: &Slot, accepts: impl Fn(&Screen) -> bool) -> Result<Uuid> {
    match slot.as_ref() {
        Some(session) if accepts(&session.screen) => Ok(session.id),
        Some(session) => Err(Error::InvalidTransition(format!(
            "{:?} does not accept this action",
            session.screen
        ))),
        None => Err(Error::NoActiveSession),
    }
}

fn attempt_event(outcome: &AttemptError) -> FlowEvent {
    match outcome {
        AttemptError::InvalidCode { remaining } => FlowEvent::CodeRejected {
            remaining: *remaining,
        },
        AttemptError::RateLimited { until_ms } | AttemptError::LockedOut { until_ms } => {
            FlowEvent::CodeLockedOut {
                until_ms: *until_ms,
            }
        }
        AttemptError::Service(_) => FlowEvent::CodeServiceError,
        AttemptError::Store(e) => {
            warn!("Attempt bookkeeping failed: {}", e);
            FlowEvent::CodeServiceError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::flow::{BiometricStatus, Notice};
    use crate::limiter::LockoutPolicy;
    use crate::mock::{MockBiometric, MockCodeService, MockVisibility};
    use crate::store::{MemoryBackend, SecurityStore};
    use crate::types::TransactionDetails;
    use std::time::Duration;

    struct Fixture {
        clock: ManualClock,
        biometric: MockBiometric,
        codes: MockCodeService,
        visibility: MockVisibility,
        orchestrator: Arc<Orchestrator>,
    }

    fn fixture(biometric: MockBiometric, codes: MockCodeService) -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let visibility = MockVisibility::new(true);
        let store = SecurityStore::open(Arc::new(MemoryBackend::new()), clock.now_ms()).shared();
        let limiter = AttemptLimiter::new(
            store,
            Arc::new(codes.clone()),
            LockoutPolicy::new(3, Duration::from_secs(60)),
            clock_arc.clone(),
        );
        let parts = Collaborators {
            user: UserId::new("user-1"),
            biometric: Arc::new(biometric.clone()),
            codes: Arc::new(codes.clone()),
            visibility: Arc::new(visibility.clone()),
        };
        Fixture {
            clock,
            biometric,
            codes,
            visibility,
            orchestrator: Arc::new(Orchestrator::new(parts, limiter, clock_arc)),
        }
    }

    fn transfer() -> VerificationContext {
        VerificationContext::Transaction(TransactionDetails::new(1250, "EUR", "alice"))
    }

    #[tokio::test]
    async fn test_enrolled_user_verifies_with_biometric() {
        let f = fixture(MockBiometric::enrolled(), MockCodeService::new("4821"));
        let step = f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        assert!(matches!(step, Step::Verified(Proof::Token(_))));
        assert_eq!(f.biometric.authenticate_calls(), 1);
        assert!(!f.orchestrator.has_session().await);
    }

    #[tokio::test]
    async fn test_unsupported_skips_biometric() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::new("4821"));
        let step = f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        assert!(matches!(step, Step::Show(Screen::CodeEntry(_))));
        assert_eq!(f.biometric.authenticate_calls(), 0);

        let step = f.orchestrator.submit_code("4821").await.unwrap();
        assert_eq!(
            step,
            Step::Verified(Proof::Code(SecretCode::parse("4821").unwrap()))
        );
    }

    #[tokio::test]
    async fn test_enrollment_offer_then_biometric() {
        let f = fixture(MockBiometric::unenrolled(), MockCodeService::new("4821"));
        let step = f.orchestrator.begin(transfer()).await.unwrap();
        assert_eq!(step, Step::Show(Screen::EnrollmentOffer));

        let step = f.orchestrator.accept_enrollment().await.unwrap();
        assert!(matches!(step, Step::Verified(Proof::Token(_))));
        assert_eq!(f.biometric.register_calls(), 1);
        assert_eq!(f.biometric.authenticate_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_enrollment_falls_back_to_code() {
        let f = fixture(MockBiometric::unenrolled(), MockCodeService::new("4821"));
        f.biometric.fail_registration(true);
        f.orchestrator.begin(transfer()).await.unwrap();

        match f.orchestrator.accept_enrollment().await.unwrap() {
            Step::Show(Screen::CodeEntry(state)) => {
                assert_eq!(state.notice, Some(Notice::EnrollmentFailed))
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(f.biometric.authenticate_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_prompt_is_not_retried_automatically() {
        let f = fixture(MockBiometric::enrolled(), MockCodeService::new("4821"));
        f.biometric.push_outcome(Err(BiometricError::Cancelled));

        let step = f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        match step {
            Step::Show(Screen::CodeEntry(state)) => {
                assert_eq!(state.notice, Some(Notice::BiometricCancelled));
                assert!(state.can_retry_biometric);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(f.orchestrator.method().await, Some(Method::Code));

        f.orchestrator.on_foreground().await.unwrap();
        assert_eq!(f.biometric.authenticate_calls(), 1);

        let step = f.orchestrator.retry_biometric().await.unwrap();
        assert!(matches!(step, Step::Verified(Proof::Token(_))));
        assert_eq!(f.biometric.authenticate_calls(), 2);
    }

    #[tokio::test]
    async fn test_hidden_app_defers_prompt_until_foreground() {
        let f = fixture(MockBiometric::enrolled(), MockCodeService::new("4821"));
        f.visibility.set_visible(false);

        let step = f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        assert_eq!(
            step,
            Step::Show(Screen::Biometric(BiometricStatus::AwaitingForeground))
        );
        assert_eq!(f.biometric.authenticate_calls(), 0);

        f.visibility.set_visible(true);
        let step = f.orchestrator.on_foreground().await.unwrap();
        assert!(matches!(step, Step::Verified(Proof::Token(_))));
        assert_eq!(f.biometric.authenticate_calls(), 1);
    }

    #[tokio::test]
    async fn test_only_one_prompt_in_flight() {
        let f = fixture(MockBiometric::enrolled(), MockCodeService::new("4821"));
        let release = f.biometric.hold_prompts();

        let orchestrator = f.orchestrator.clone();
        let first = tokio::spawn(async move { orchestrator.begin(VerificationContext::Unlock).await });

        while f.biometric.authenticate_calls() == 0 {
            tokio::task::yield_now().await;
        }
        let second = f.orchestrator.on_foreground().await.unwrap();
        assert_eq!(
            second,
            Step::Show(Screen::Biometric(BiometricStatus::Prompting))
        );

        release.notify_one();
        let step = first.await.unwrap().unwrap();
        assert!(matches!(step, Step::Verified(Proof::Token(_))));
        assert_eq!(f.biometric.authenticate_calls(), 1);
    }

    #[tokio::test]
    async fn test_sibling_defers_while_prompt_is_open() {
        let f = fixture(MockBiometric::enrolled(), MockCodeService::new("4821"));
        f.biometric.hold_prompts();
        let sibling = f.orchestrator.sibling();

        let orchestrator = f.orchestrator.clone();
        let first = tokio::spawn(async move { orchestrator.begin(VerificationContext::Unlock).await });
        while f.biometric.authenticate_calls() == 0 {
            tokio::task::yield_now().await;
        }

        let step = sibling.begin(transfer()).await.unwrap();
        assert_eq!(
            step,
            Step::Show(Screen::Biometric(BiometricStatus::AwaitingForeground))
        );
        assert_eq!(f.biometric.authenticate_calls(), 1);

        f.biometric.release_prompts();
        assert!(matches!(first.await.unwrap().unwrap(), Step::Verified(_)));

        let step = sibling.on_foreground().await.unwrap();
        assert!(matches!(step, Step::Verified(Proof::Token(_))));
        assert_eq!(f.biometric.authenticate_calls(), 2);
        assert_eq!(f.biometric.max_open_prompts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_verify_once() {
        let codes = MockCodeService::new("4821");
        codes.respond_after(Duration::from_millis(20));
        let f = fixture(MockBiometric::unsupported(), codes);
        f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let orchestrator = f.orchestrator.clone();
                tokio::spawn(async move { orchestrator.submit_code("0000").await })
            })
            .collect();

        let mut waiting = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Step::Show(Screen::CodeEntry(state)) if state.submitting => waiting += 1,
                Step::Show(Screen::CodeEntry(state)) => {
                    assert_eq!(state.notice, Some(Notice::InvalidCode { remaining: 2 }))
                }
                other => panic!("unexpected step {:?}", other),
            }
        }
        assert_eq!(waiting, 9);
        assert_eq!(f.codes.verify_calls(), 1);
        assert_eq!(f.orchestrator.limiter().status("unlock").await.failed, 1);

        match f.orchestrator.current().await {
            Some(Screen::CodeEntry(state)) => assert!(!state.submitting),
            other => panic!("unexpected screen {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_biometric_result_after_close_is_discarded() {
        let f = fixture(MockBiometric::enrolled(), MockCodeService::new("4821"));
        let release = f.biometric.hold_prompts();

        let orchestrator = f.orchestrator.clone();
        let pending = tokio::spawn(async move { orchestrator.begin(VerificationContext::Unlock).await });
        while f.biometric.authenticate_calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(f.orchestrator.close().await);
        release.notify_one();
        assert_eq!(
            pending.await.unwrap().unwrap(),
            Step::Ended(EndReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_invalid_codes_lock_out_context() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::new("4821"));
        f.orchestrator.begin(transfer()).await.unwrap();

        for remaining in [2, 1] {
            match f.orchestrator.submit_code("0000").await.unwrap() {
                Step::Show(Screen::CodeEntry(state)) => {
                    assert_eq!(state.notice, Some(Notice::InvalidCode { remaining }))
                }
                other => panic!("unexpected step {:?}", other),
            }
        }
        match f.orchestrator.submit_code("0000").await.unwrap() {
            Step::Show(Screen::CodeEntry(state)) => {
                assert!(state.is_disabled(f.clock.now_ms()))
            }
            other => panic!("unexpected step {:?}", other),
        }

        f.orchestrator.submit_code("0000").await.unwrap();
        assert_eq!(f.codes.verify_calls(), 3);
        assert_eq!(f.codes.contexts(), vec!["transaction"; 3]);
    }

    #[tokio::test]
    async fn test_malformed_code_is_not_counted() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::new("4821"));
        f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();

        match f.orchestrator.submit_code("12ab").await.unwrap() {
            Step::Show(Screen::CodeEntry(state)) => {
                assert_eq!(state.notice, Some(Notice::MalformedCode))
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(f.codes.verify_calls(), 0);
        assert_eq!(f.orchestrator.limiter().status("unlock").await.failed, 0);
    }

    #[tokio::test]
    async fn test_service_error_shows_generic_notice() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::new("4821"));
        f.codes.fail_with_service_error(true);
        f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();

        match f.orchestrator.submit_code("4821").await.unwrap() {
            Step::Show(Screen::CodeEntry(state)) => {
                assert_eq!(state.notice, Some(Notice::ServiceUnavailable))
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(f.orchestrator.limiter().status("unlock").await.failed, 0);
    }

    #[tokio::test]
    async fn test_transaction_without_code_routes_to_setup() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::unconfigured());
        let step = f.orchestrator.begin(transfer()).await.unwrap();
        assert_eq!(step, Step::Show(Screen::CodeSetup { notice: None }));

        let step = f.orchestrator.submit_setup("975310").await.unwrap();
        assert_eq!(
            step,
            Step::Verified(Proof::Code(SecretCode::parse("975310").unwrap()))
        );
        assert_eq!(f.codes.setup_calls(), 1);
    }

    #[tokio::test]
    async fn test_unlock_without_any_method_ends() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::unconfigured());
        let step = f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        assert_eq!(step, Step::Ended(EndReason::NoMethodAvailable));
        assert!(!f.orchestrator.has_session().await);
        assert_eq!(f.codes.setup_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_begin_is_rejected() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::new("4821"));
        f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        assert!(matches!(
            f.orchestrator.begin(transfer()).await,
            Err(Error::SessionInProgress)
        ));
    }

    #[tokio::test]
    async fn test_close_keeps_attempt_counters() {
        let f = fixture(MockBiometric::unsupported(), MockCodeService::new("4821"));
        f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        f.orchestrator.submit_code("0000").await.unwrap();

        assert!(f.orchestrator.close().await);
        assert!(!f.orchestrator.close().await);
        assert_eq!(f.orchestrator.limiter().status("unlock").await.failed, 1);
    }

    #[tokio::test]
    async fn test_biometric_success_resets_counters() {
        let f = fixture(MockBiometric::enrolled(), MockCodeService::new("4821"));
        f.biometric.push_outcome(Err(BiometricError::Failed("no match".into())));

        f.orchestrator.begin(VerificationContext::Unlock).await.unwrap();
        f.orchestrator.submit_code("0000").await.unwrap();
        assert_eq!(f.orchestrator.limiter().status("unlock").await.failed, 1);

        let step = f.orchestrator.retry_biometric().await.unwrap();
        assert!(matches!(step, Step::Verified(Proof::Token(_))));
        assert_eq!(f.orchestrator.limiter().status("unlock").await.failed, 0);
    }
}
