//! Core value types shared by the lock, orchestrator and gate

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::{MAX_CODE_LENGTH, MIN_CODE_LENGTH};

/// Identifier of the authenticated user owning biometric enrollments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive metadata of a gated transaction, shown on the verification screens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDetails {
    /// Amount in minor units (cents)
    pub amount_minor: u64,
    /// ISO 4217 currency code
    pub currency: String,
    /// Display name or handle of the recipient
    pub recipient: String,
}

impl TransactionDetails {
    pub fn new(amount_minor: u64, currency: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
            recipient: recipient.into(),
        }
    }

    /// Human-readable summary, e.g. "12.50 EUR to alice"
    pub fn summary(&self) -> String {
        format!(
            "{}.{:02} {} to {}",
            self.amount_minor / 100,
            self.amount_minor % 100,
            self.currency,
            self.recipient
        )
    }
}

/// Why verification is being requested.
///
/// Attempt counters are scoped by [`VerificationContext::key`], so every
/// transaction shares one counter regardless of its details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationContext {
    /// Re-authentication after an inactivity lock
    Unlock,
    /// Authorization of a sensitive action
    Transaction(TransactionDetails),
}

impl VerificationContext {
    pub const UNLOCK_KEY: &'static str = "unlock";
    pub const TRANSACTION_KEY: &'static str = "transaction";

    /// Key used for the per-context attempt counters
    pub fn key(&self) -> &'static str {
        match self {
            VerificationContext::Unlock => Self::UNLOCK_KEY,
            VerificationContext::Transaction(_) => Self::TRANSACTION_KEY,
        }
    }

    pub fn details(&self) -> Option<&TransactionDetails> {
        match self {
            VerificationContext::Unlock => None,
            VerificationContext::Transaction(details) => Some(details),
        }
    }

    pub fn is_unlock(&self) -> bool {
        matches!(self, VerificationContext::Unlock)
    }
}

impl fmt::Display for VerificationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Verification method chosen for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Unset,
    Biometric,
    Code,
}

/// Opaque proof returned by a successful biometric assertion
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationToken(String);

impl VerificationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VerificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.0.chars().take(6).collect();
        write!(f, "VerificationToken({}…)", shown)
    }
}

/// Plaintext secret code, zeroized on drop and never printed
#[derive(Clone)]
pub struct SecretCode(Zeroizing<String>);

impl SecretCode {
    /// Validate and wrap user input: digits only, within the allowed length
    pub fn parse(input: &str) -> Result<Self> {
        let len = input.chars().count();
        if !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&len) {
            return Err(Error::InvalidCodeFormat(format!(
                "code must be between {} and {} digits",
                MIN_CODE_LENGTH, MAX_CODE_LENGTH
            )));
        }
        if !input.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidCodeFormat(
                "code must contain only digits".to_string(),
            ));
        }
        Ok(Self(Zeroizing::new(input.to_string())))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for SecretCode {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for SecretCode {}

impl fmt::Debug for SecretCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretCode(***)")
    }
}

/// Proof of presence attached to an unlock or a downstream request.
/// Exactly one of the two is ever produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proof {
    Token(VerificationToken),
    Code(SecretCode),
}

impl Proof {
    pub fn method(&self) -> Method {
        match self {
            Proof::Token(_) => Method::Biometric,
            Proof::Code(_) => Method::Code,
        }
    }
}
