//! Platform biometric subsystem boundary
//!
//! The platform shows the actual prompt. Its results are not returned from
//! [`BiometricPlatform::present`]; they arrive later as [`PromptEvent`]s that
//! the enforcer feeds back into the orchestrator on its own task, so a result
//! can never interleave with a `cancel` or a fresh `authenticate`.

use serde::{Deserialize, Serialize};

use applock_core::{AuthenticatorClass, Availability, BiometricError, BiometricErrorKind, SessionId};

/// Request to present a biometric prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Session the result must be tagged with
    pub session: SessionId,
    /// Package being unlocked
    pub package: String,
    pub title: String,
    pub subtitle: String,
    /// Strongest authenticator class available on the device
    pub authenticator: AuthenticatorClass,
    /// Device PIN/pattern/password may be used as an alternative
    pub allow_device_credential: bool,
    pub confirmation_required: bool,
}

/// Outcome reported by the platform for a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromptOutcome {
    /// Sample accepted
    Succeeded,
    /// Sample recognized but did not match; the prompt stays up
    Rejected,
    /// Prompt ended with an error (including user cancellation)
    Error {
        kind: BiometricErrorKind,
        message: String,
    },
}

impl PromptOutcome {
    pub fn error(kind: BiometricErrorKind) -> Self {
        PromptOutcome::Error {
            kind,
            message: kind.user_message().to_string(),
        }
    }
}

/// A prompt outcome tagged with its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptEvent {
    pub session: SessionId,
    #[serde(flatten)]
    pub outcome: PromptOutcome,
}

impl PromptEvent {
    pub fn new(session: SessionId, outcome: PromptOutcome) -> Self {
        Self { session, outcome }
    }
}

/// Platform biometric subsystem
pub trait BiometricPlatform: Send + Sync {
    /// Hardware and enrollment status
    fn availability(&self) -> Availability;

    /// Strongest authenticator class the device offers
    fn strongest_class(&self) -> AuthenticatorClass {
        AuthenticatorClass::BiometricStrong
    }

    /// Begin presenting a prompt; must not block on the user
    fn present(&self, request: &PromptRequest) -> Result<(), BiometricError>;

    /// Ask the platform to close the prompt for a session; must not block
    fn cancel(&self, session: SessionId);
}
