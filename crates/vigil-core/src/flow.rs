//! Verification screen flow
//!
//! One screen is active per session; every change goes through
//! [`transition`], which rejects combinations the UI must never show.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// State of the biometric screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiometricStatus {
    /// Platform prompt is (about to be) shown
    Prompting,
    /// App is hidden; the prompt waits for the foreground
    AwaitingForeground,
}

/// Message shown alongside a screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// Informational: the user dismissed the biometric prompt
    BiometricCancelled,
    /// Short retry affordance after a failed biometric match
    BiometricFailed,
    EnrollmentFailed,
    /// Input did not look like a code; no attempt was counted
    MalformedCode,
    InvalidCode { remaining: u32 },
    RateLimited { until_ms: u64 },
    /// Generic retry prompt; does not reveal whether the code was right
    ServiceUnavailable,
    SetupFailed,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::BiometricCancelled => "Biometric check skipped. Enter your code instead.".into(),
            Notice::BiometricFailed => "Biometric check failed. Try again or enter your code.".into(),
            Notice::EnrollmentFailed => "Could not set up biometrics. Enter your code instead.".into(),
            Notice::MalformedCode => "Codes are 4 to 8 digits.".into(),
            Notice::InvalidCode { remaining } => {
                format!("Invalid code. {} attempts remaining.", remaining)
            }
            Notice::RateLimited { .. } => {
                "Too many invalid codes. Input is disabled for now.".into()
            }
            Notice::ServiceUnavailable => "Something went wrong. Please try again.".into(),
            Notice::SetupFailed => "Could not save your code. Please try again.".into(),
        }
    }
}

/// State of the code entry screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeEntryState {
    pub notice: Option<Notice>,
    /// Input stays disabled before this instant
    pub disabled_until: Option<u64>,
    /// Biometrics are available for an explicit user retry
    pub can_retry_biometric: bool,
    /// A code is being verified; further input waits for its result
    pub submitting: bool,
}

impl CodeEntryState {
    pub fn is_disabled(&self, now_ms: u64) -> bool {
        self.disabled_until.map(|until| now_ms < until).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Screen {
    EnrollmentOffer,
    Biometric(BiometricStatus),
    CodeEntry(CodeEntryState),
    CodeSetup { notice: Option<Notice> },
}

/// Input to [`transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    EnrollmentAccepted,
    EnrollmentDeclined,
    EnrollmentFailed,
    BiometricDeferred,
    BiometricResumed,
    BiometricCancelled,
    BiometricFailed,
    BiometricRetry,
    CodeSubmitted,
    CodeMalformed,
    CodeRejected { remaining: u32 },
    CodeLockedOut { until_ms: u64 },
    CodeServiceError,
    CodeSetupRequired,
    SetupFailed,
}

/// First screen of a challenge, from platform support and enrollment
pub fn initial(supported: bool, enrolled: bool) -> Screen {
    match (supported, enrolled) {
        (false, _) => Screen::CodeEntry(CodeEntryState::default()),
        (true, false) => Screen::EnrollmentOffer,
        (true, true) => Screen::Biometric(BiometricStatus::Prompting),
    }
}

fn code_entry(notice: Option<Notice>, can_retry_biometric: bool) -> Screen {
    Screen::CodeEntry(CodeEntryState {
        notice,
        disabled_until: None,
        can_retry_biometric,
        submitting: false,
    })
}

pub fn transition(screen: &Screen, event: FlowEvent) -> Result<Screen> {
    use BiometricStatus::*;
    use FlowEvent::*;

    let next = match (*screen, event) {
        (Screen::EnrollmentOffer, EnrollmentAccepted) => Screen::Biometric(Prompting),
        (Screen::EnrollmentOffer, EnrollmentDeclined) => code_entry(None, false),
        (Screen::EnrollmentOffer, EnrollmentFailed) => {
            code_entry(Some(Notice::EnrollmentFailed), false)
        }

        (Screen::Biometric(_), BiometricDeferred) => Screen::Biometric(AwaitingForeground),
        (Screen::Biometric(AwaitingForeground), BiometricResumed) => Screen::Biometric(Prompting),
        (Screen::Biometric(Prompting), BiometricCancelled) => {
            code_entry(Some(Notice::BiometricCancelled), true)
        }
        (Screen::Biometric(Prompting), BiometricFailed) => {
            code_entry(Some(Notice::BiometricFailed), true)
        }

        (Screen::CodeEntry(state), BiometricRetry)
            if state.can_retry_biometric && !state.submitting =>
        {
            Screen::Biometric(Prompting)
        }
        (Screen::CodeEntry(state), CodeSubmitted) if !state.submitting => {
            Screen::CodeEntry(CodeEntryState {
                submitting: true,
                ..state
            })
        }
        (Screen::CodeEntry(state), CodeMalformed) => Screen::CodeEntry(CodeEntryState {
            notice: Some(Notice::MalformedCode),
            ..state
        }),
        (Screen::CodeEntry(state), CodeRejected { remaining }) => {
            Screen::CodeEntry(CodeEntryState {
                notice: Some(Notice::InvalidCode { remaining }),
                disabled_until: None,
                submitting: false,
                ..state
            })
        }
        (Screen::CodeEntry(state), CodeLockedOut { until_ms }) => {
            Screen::CodeEntry(CodeEntryState {
                notice: Some(Notice::RateLimited { until_ms }),
                disabled_until: Some(until_ms),
                submitting: false,
                ..state
            })
        }
        (Screen::CodeEntry(state), CodeServiceError) => Screen::CodeEntry(CodeEntryState {
            notice: Some(Notice::ServiceUnavailable),
            submitting: false,
            ..state
        }),
        (Screen::CodeEntry(_), CodeSetupRequired) => Screen::CodeSetup { notice: None },

        (Screen::CodeSetup { .. }, CodeMalformed) => Screen::CodeSetup {
            notice: Some(Notice::MalformedCode),
        },
        (Screen::CodeSetup { .. }, SetupFailed) => Screen::CodeSetup {
            notice: Some(Notice::SetupFailed),
        },

        (from, event) => {
            return Err(Error::InvalidTransition(format!(
                "{:?} does not accept {:?}",
                from, event
            )))
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_screen_selection() {
        assert!(matches!(initial(false, true), Screen::CodeEntry(_)));
        assert!(matches!(initial(false, false), Screen::CodeEntry(_)));
        assert_eq!(initial(true, false), Screen::EnrollmentOffer);
        assert_eq!(
            initial(true, true),
            Screen::Biometric(BiometricStatus::Prompting)
        );
    }

    #[test]
    fn test_declined_enrollment_goes_to_code() {
        let next = transition(&Screen::EnrollmentOffer, FlowEvent::EnrollmentDeclined).unwrap();
        assert_eq!(next, code_entry(None, false));
    }

    #[test]
    fn test_cancel_falls_back_with_informational_notice() {
        let prompting = Screen::Biometric(BiometricStatus::Prompting);
        let next = transition(&prompting, FlowEvent::BiometricCancelled).unwrap();
        match next {
            Screen::CodeEntry(state) => {
                assert_eq!(state.notice, Some(Notice::BiometricCancelled));
                assert!(state.can_retry_biometric);
                assert!(state.disabled_until.is_none());
            }
            other => panic!("unexpected screen {:?}", other),
        }
    }

    #[test]
    fn test_retry_requires_biometric_availability() {
        let no_retry = code_entry(None, false);
        assert!(transition(&no_retry, FlowEvent::BiometricRetry).is_err());

        let retry = code_entry(Some(Notice::BiometricFailed), true);
        assert_eq!(
            transition(&retry, FlowEvent::BiometricRetry).unwrap(),
            Screen::Biometric(BiometricStatus::Prompting)
        );
    }

    #[test]
    fn test_submission_in_flight_blocks_second_submit_and_retry() {
        let idle = code_entry(Some(Notice::BiometricFailed), true);
        let submitting = transition(&idle, FlowEvent::CodeSubmitted).unwrap();
        assert!(matches!(submitting, Screen::CodeEntry(s) if s.submitting));

        assert!(transition(&submitting, FlowEvent::CodeSubmitted).is_err());
        assert!(transition(&submitting, FlowEvent::BiometricRetry).is_err());

        let answered = transition(&submitting, FlowEvent::CodeRejected { remaining: 2 }).unwrap();
        match answered {
            Screen::CodeEntry(state) => {
                assert!(!state.submitting);
                assert_eq!(state.notice, Some(Notice::InvalidCode { remaining: 2 }));
            }
            other => panic!("unexpected screen {:?}", other),
        }
    }

    #[test]
    fn test_lockout_disables_input() {
        let next = transition(&code_entry(None, false), FlowEvent::CodeLockedOut { until_ms: 10 })
            .unwrap();
        match next {
            Screen::CodeEntry(state) => {
                assert!(state.is_disabled(9));
                assert!(!state.is_disabled(10));
            }
            other => panic!("unexpected screen {:?}", other),
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(transition(&Screen::EnrollmentOffer, FlowEvent::CodeRejected { remaining: 1 }).is_err());
        assert!(transition(
            &Screen::Biometric(BiometricStatus::AwaitingForeground),
            FlowEvent::BiometricCancelled
        )
        .is_err());
        assert!(transition(&Screen::CodeSetup { notice: None }, FlowEvent::BiometricRetry).is_err());
    }

    #[test]
    fn test_deferred_prompt_resumes() {
        let deferred = transition(
            &Screen::Biometric(BiometricStatus::Prompting),
            FlowEvent::BiometricDeferred,
        )
        .unwrap();
        assert_eq!(deferred, Screen::Biometric(BiometricStatus::AwaitingForeground));
        assert_eq!(
            transition(&deferred, FlowEvent::BiometricResumed).unwrap(),
            Screen::Biometric(BiometricStatus::Prompting)
        );
    }
}
