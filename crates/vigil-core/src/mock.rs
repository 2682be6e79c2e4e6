//! In-memory collaborators for tests.
//!
//! Every mock is a cheap clone over shared state so a test can keep a handle
//! after moving one into the engine, and every call is counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::providers::{
    BiometricError, BiometricProvider, CodeServiceError, EnrollmentError, SecretCodeService,
    SideEffect, SideEffectError, TransactionError, TransactionService, Visibility,
};
use crate::types::{Proof, SecretCode, TransactionDetails, UserId, VerificationToken};

// ---- biometric ----

#[derive(Default)]
struct BiometricInner {
    supported: AtomicBool,
    enrolled: AtomicBool,
    register_fails: AtomicBool,
    outcomes: Mutex<VecDeque<Result<VerificationToken, BiometricError>>>,
    hold: Mutex<Option<Arc<Notify>>>,
    authenticate_calls: AtomicU32,
    register_calls: AtomicU32,
    open_prompts: AtomicU32,
    max_open_prompts: AtomicU32,
}

/// Platform biometric API double. Authenticates successfully unless told otherwise.
#[derive(Clone, Default)]
pub struct MockBiometric {
    inner: Arc<BiometricInner>,
}

impl MockBiometric {
    pub fn new(supported: bool, enrolled: bool) -> Self {
        let mock = Self::default();
        mock.inner.supported.store(supported, Ordering::SeqCst);
        mock.inner.enrolled.store(enrolled, Ordering::SeqCst);
        mock
    }

    pub fn unsupported() -> Self {
        Self::new(false, false)
    }

    pub fn enrolled() -> Self {
        Self::new(true, true)
    }

    pub fn unenrolled() -> Self {
        Self::new(true, false)
    }

    /// Queue the result of the next `authenticate` call
    pub fn push_outcome(&self, outcome: Result<VerificationToken, BiometricError>) {
        if let Ok(mut outcomes) = self.inner.outcomes.lock() {
            outcomes.push_back(outcome);
        }
    }

    pub fn fail_registration(&self, fail: bool) {
        self.inner.register_fails.store(fail, Ordering::SeqCst);
    }

    /// Keep the next prompts open until the returned handle is notified
    pub fn hold_prompts(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        if let Ok(mut hold) = self.inner.hold.lock() {
            *hold = Some(notify.clone());
        }
        notify
    }

    /// Stop holding prompts and let the one currently open finish
    pub fn release_prompts(&self) {
        let hold = self.inner.hold.lock().ok().and_then(|mut h| h.take());
        if let Some(notify) = hold {
            notify.notify_one();
        }
    }

    pub fn authenticate_calls(&self) -> u32 {
        self.inner.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> u32 {
        self.inner.register_calls.load(Ordering::SeqCst)
    }

    /// Highest number of prompts that were open at the same time
    pub fn max_open_prompts(&self) -> u32 {
        self.inner.max_open_prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BiometricProvider for MockBiometric {
    fn is_supported(&self) -> bool {
        self.inner.supported.load(Ordering::SeqCst)
    }

    fn has_enrollment(&self, _user: &UserId) -> bool {
        self.inner.enrolled.load(Ordering::SeqCst)
    }

    async fn register(&self, label: &str) -> Result<(), EnrollmentError> {
        self.inner.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.register_fails.load(Ordering::SeqCst) {
            return Err(EnrollmentError::Failed(format!("cannot enroll {}", label)));
        }
        self.inner.enrolled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn authenticate(&self) -> Result<VerificationToken, BiometricError> {
        let n = self.inner.authenticate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let open = self.inner.open_prompts.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_open_prompts.fetch_max(open, Ordering::SeqCst);

        let hold = self.inner.hold.lock().ok().and_then(|h| h.clone());
        if let Some(notify) = hold {
            notify.notified().await;
        }
        self.inner.open_prompts.fetch_sub(1, Ordering::SeqCst);

        let queued = self
            .inner
            .outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front());
        queued.unwrap_or_else(|| Ok(VerificationToken::new(format!("bio-token-{}", n))))
    }
}

// ---- secret code ----

#[derive(Default)]
struct CodeInner {
    code: Mutex<Option<String>>,
    service_error: AtomicBool,
    verify_delay: Mutex<Option<Duration>>,
    verify_calls: AtomicU32,
    setup_calls: AtomicU32,
    contexts: Mutex<Vec<String>>,
}

/// Secret-code backend double holding the one valid code
#[derive(Clone, Default)]
pub struct MockCodeService {
    inner: Arc<CodeInner>,
}

impl MockCodeService {
    pub fn new(code: &str) -> Self {
        let mock = Self::default();
        if let Ok(mut slot) = mock.inner.code.lock() {
            *slot = Some(code.to_string());
        }
        mock
    }

    /// A user who never set a code
    pub fn unconfigured() -> Self {
        Self::default()
    }

    pub fn fail_with_service_error(&self, fail: bool) {
        self.inner.service_error.store(fail, Ordering::SeqCst);
    }

    /// Make every `verify` take `delay` before answering
    pub fn respond_after(&self, delay: Duration) {
        if let Ok(mut slot) = self.inner.verify_delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn verify_calls(&self) -> u32 {
        self.inner.verify_calls.load(Ordering::SeqCst)
    }

    pub fn setup_calls(&self) -> u32 {
        self.inner.setup_calls.load(Ordering::SeqCst)
    }

    /// Contexts passed to `verify`, in call order
    pub fn contexts(&self) -> Vec<String> {
        self.inner
            .contexts
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecretCodeService for MockCodeService {
    fn is_configured(&self, _user: &UserId) -> bool {
        self.inner.code.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    async fn verify(&self, code: &SecretCode, context: &str) -> Result<(), CodeServiceError> {
        self.inner.verify_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut contexts) = self.inner.contexts.lock() {
            contexts.push(context.to_string());
        }
        let delay = self.inner.verify_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.service_error.load(Ordering::SeqCst) {
            return Err(CodeServiceError::Service("connection reset".to_string()));
        }

        let stored = self.inner.code.lock().ok().and_then(|c| c.clone());
        match stored {
            Some(expected) if expected == code.expose() => Ok(()),
            _ => Err(CodeServiceError::InvalidCode),
        }
    }

    async fn setup(&self, code: &SecretCode) -> Result<(), CodeServiceError> {
        self.inner.setup_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.service_error.load(Ordering::SeqCst) {
            return Err(CodeServiceError::Service("connection reset".to_string()));
        }
        if let Ok(mut slot) = self.inner.code.lock() {
            *slot = Some(code.expose().to_string());
        }
        Ok(())
    }
}

// ---- transactions ----

#[derive(Default)]
struct TransactionInner {
    responses: Mutex<VecDeque<Result<String, TransactionError>>>,
    proofs: Mutex<Vec<Proof>>,
}

/// Transfer backend double; succeeds with a receipt unless a response is queued
#[derive(Clone, Default)]
pub struct MockTransactionService {
    inner: Arc<TransactionInner>,
}

impl MockTransactionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<String, TransactionError>) {
        if let Ok(mut responses) = self.inner.responses.lock() {
            responses.push_back(response);
        }
    }

    /// Proofs attached to executed requests, in call order
    pub fn proofs(&self) -> Vec<Proof> {
        self.inner.proofs.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TransactionService for MockTransactionService {
    type Request = TransactionDetails;
    type Receipt = String;

    async fn execute(
        &self,
        request: &TransactionDetails,
        proof: &Proof,
    ) -> Result<String, TransactionError> {
        let n = match self.inner.proofs.lock() {
            Ok(mut proofs) => {
                proofs.push(proof.clone());
                proofs.len()
            }
            Err(_) => 0,
        };
        let queued = self
            .inner
            .responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front());
        queued.unwrap_or_else(|| Ok(format!("receipt-{}-{}", n, request.recipient)))
    }
}

// ---- visibility ----

#[derive(Clone)]
pub struct MockVisibility {
    visible: Arc<AtomicBool>,
}

impl MockVisibility {
    pub fn new(visible: bool) -> Self {
        Self {
            visible: Arc::new(AtomicBool::new(visible)),
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

impl Visibility for MockVisibility {
    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}

// ---- side effects ----

/// Side effect that counts runs and optionally fails
#[derive(Clone)]
pub struct RecordingSideEffect {
    name: String,
    fail: bool,
    runs: Arc<AtomicU32>,
    done: Arc<Notify>,
}

impl RecordingSideEffect {
    pub fn succeeding(name: &str) -> Self {
        Self::build(name, false)
    }

    pub fn failing(name: &str) -> Self {
        Self::build(name, true)
    }

    fn build(name: &str, fail: bool) -> Self {
        Self {
            name: name.to_string(),
            fail,
            runs: Arc::new(AtomicU32::new(0)),
            done: Arc::new(Notify::new()),
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Resolves once a run has finished
    pub async fn finished(&self) {
        self.done.notified().await
    }
}

#[async_trait]
impl SideEffect for RecordingSideEffect {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), SideEffectError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.done.notify_one();
        if self.fail {
            return Err(SideEffectError("device registration unavailable".to_string()));
        }
        Ok(())
    }
}
