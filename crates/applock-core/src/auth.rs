//! Authentication session types and the biometric error taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lock::AuthFactor;
use crate::types::{PackageName, Timestamp};

/// State of the process-wide authentication session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No session (initial state and reset target)
    #[default]
    Idle,
    /// Prompt is showing
    Authenticating,
    /// Authentication succeeded
    Success,
    /// Sample recognized but rejected; the session may retry
    Failed,
    /// Platform error ended the session
    Error,
    /// Session cancelled by the user or by teardown
    Cancelled,
}

impl AuthState {
    /// Terminal states end the session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthState::Success | AuthState::Error | AuthState::Cancelled
        )
    }

    /// States in which a session exists and blocks a new one
    pub fn is_active(&self) -> bool {
        matches!(self, AuthState::Authenticating | AuthState::Failed)
    }
}

/// Whether the biometric factor can be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    NoHardware,
    HardwareUnavailable,
    NoEnrolledFactors,
    PolicyDisabled,
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    /// Error kind reported when authentication is attempted in this state
    pub fn error_kind(&self) -> Option<BiometricErrorKind> {
        match self {
            Availability::Available => None,
            Availability::NoHardware => Some(BiometricErrorKind::NoHardware),
            Availability::HardwareUnavailable => Some(BiometricErrorKind::HardwareUnavailable),
            Availability::NoEnrolledFactors => Some(BiometricErrorKind::NoEnrolledFactors),
            Availability::PolicyDisabled => Some(BiometricErrorKind::PolicyDisabled),
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Availability::Available => "available",
            Availability::NoHardware => "no hardware",
            Availability::HardwareUnavailable => "hardware unavailable",
            Availability::NoEnrolledFactors => "no enrolled factors",
            Availability::PolicyDisabled => "disabled by policy",
        };
        f.write_str(s)
    }
}

/// Errors surfaced to callers of biometric authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiometricErrorKind {
    NoHardware,
    HardwareUnavailable,
    NoEnrolledFactors,
    /// Too many attempts; temporary
    Lockout,
    /// Too many attempts; requires the device credential to clear
    LockoutPermanent,
    Timeout,
    UnableToProcess,
    /// User dismissed the prompt or pressed the negative button
    UserCancelled,
    VendorError,
    PolicyDisabled,
}

impl BiometricErrorKind {
    /// Human-readable message for presenting to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            BiometricErrorKind::NoHardware => "No biometric hardware available",
            BiometricErrorKind::HardwareUnavailable => "Biometric hardware unavailable",
            BiometricErrorKind::NoEnrolledFactors => "No biometrics enrolled on device",
            BiometricErrorKind::Lockout => "Too many failed attempts. Try again later.",
            BiometricErrorKind::LockoutPermanent => "Biometric authentication permanently locked",
            BiometricErrorKind::Timeout => "Authentication timeout",
            BiometricErrorKind::UnableToProcess => "Unable to process biometric",
            BiometricErrorKind::UserCancelled => "Authentication cancelled",
            BiometricErrorKind::VendorError => "Biometric authentication error",
            BiometricErrorKind::PolicyDisabled => "Biometric authentication is disabled",
        }
    }

    /// Session state this error leaves behind
    pub fn terminal_state(&self) -> AuthState {
        match self {
            BiometricErrorKind::UserCancelled => AuthState::Cancelled,
            _ => AuthState::Error,
        }
    }

    /// Whether the UI should steer the user to the knowledge factor
    pub fn suggests_knowledge_fallback(&self) -> bool {
        !matches!(self, BiometricErrorKind::UserCancelled)
    }
}

impl fmt::Display for BiometricErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BiometricErrorKind::NoHardware => "no_hardware",
            BiometricErrorKind::HardwareUnavailable => "hardware_unavailable",
            BiometricErrorKind::NoEnrolledFactors => "no_enrolled_factors",
            BiometricErrorKind::Lockout => "lockout",
            BiometricErrorKind::LockoutPermanent => "lockout_permanent",
            BiometricErrorKind::Timeout => "timeout",
            BiometricErrorKind::UnableToProcess => "unable_to_process",
            BiometricErrorKind::UserCancelled => "user_cancelled",
            BiometricErrorKind::VendorError => "vendor_error",
            BiometricErrorKind::PolicyDisabled => "policy_disabled",
        };
        f.write_str(s)
    }
}

/// A biometric error code with its message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BiometricError {
    pub kind: BiometricErrorKind,
    pub message: String,
}

impl BiometricError {
    pub fn new(kind: BiometricErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error carrying the default user-facing message for its kind
    pub fn from_kind(kind: BiometricErrorKind) -> Self {
        Self::new(kind, kind.user_message())
    }
}

/// Authenticator class a prompt is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticatorClass {
    #[default]
    BiometricStrong,
    BiometricWeak,
}

/// Identifier of a single authentication session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// The single in-flight authentication session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub id: SessionId,
    pub target_package: PackageName,
    pub factor: AuthFactor,
    pub state: AuthState,
    pub started_at: Timestamp,
}

impl AuthSession {
    pub fn new(
        id: SessionId,
        target_package: PackageName,
        factor: AuthFactor,
        started_at: Timestamp,
    ) -> Self {
        Self {
            id,
            target_package,
            factor,
            state: AuthState::Authenticating,
            started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(AuthState::Success.is_terminal());
        assert!(AuthState::Error.is_terminal());
        assert!(AuthState::Cancelled.is_terminal());
        assert!(!AuthState::Failed.is_terminal());
        assert!(!AuthState::Idle.is_terminal());
    }

    #[test]
    fn test_failed_state_still_blocks() {
        assert!(AuthState::Authenticating.is_active());
        assert!(AuthState::Failed.is_active());
        assert!(!AuthState::Idle.is_active());
    }

    #[test]
    fn test_availability_maps_to_error_kind() {
        assert_eq!(Availability::Available.error_kind(), None);
        assert_eq!(
            Availability::NoEnrolledFactors.error_kind(),
            Some(BiometricErrorKind::NoEnrolledFactors)
        );
        assert_eq!(
            Availability::PolicyDisabled.error_kind(),
            Some(BiometricErrorKind::PolicyDisabled)
        );
    }

    #[test]
    fn test_user_cancel_is_cancelled_not_error() {
        assert_eq!(
            BiometricErrorKind::UserCancelled.terminal_state(),
            AuthState::Cancelled
        );
        assert_eq!(BiometricErrorKind::Lockout.terminal_state(), AuthState::Error);
        assert!(BiometricErrorKind::LockoutPermanent.suggests_knowledge_fallback());
    }

    #[test]
    fn test_error_display() {
        let err = BiometricError::from_kind(BiometricErrorKind::Timeout);
        assert_eq!(err.to_string(), "timeout: Authentication timeout");
    }
}
