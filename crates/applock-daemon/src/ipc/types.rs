//! Control protocol messages

use serde::{Deserialize, Serialize};

use applock_core::{AuthenticatorClass, Availability, LockState, LockType, SessionId};

use crate::auth::PromptEvent;
use crate::engine::EngineStatus;
use crate::foreground::{AccessibilityEvent, UsageEventKind};
use crate::presenter::HostCommand;
use crate::tamper::{TamperAction, TamperEvent};

/// Requests accepted on the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// Check if daemon is running
    Ping,

    /// Engine snapshot
    Status,

    /// Lock state of one package
    LockState { package: String },

    /// Candidate PIN or pattern typed on the challenge surface
    SubmitKnowledgeFactor { package: String, candidate: String },

    /// User tapped the biometric button
    RequestBiometric { package: String },

    /// Close the biometric prompt, if any
    CancelBiometric,

    /// Result from the host's biometric prompt
    BiometricResult { event: PromptEvent },

    /// Host biometric hardware and enrollment status
    BiometricAvailability {
        availability: Availability,
        #[serde(default)]
        authenticator: AuthenticatorClass,
    },

    /// The host tore down the challenge surface
    PresenterClosed { package: String },

    /// Whether the surface must survive a pause
    RetainPresenter,

    /// Raw window event from the accessibility service
    AccessibilityEvent { event: AccessibilityEvent },

    /// Usage-stats record
    UsageEvent {
        package: String,
        kind: UsageEventKind,
    },

    /// Observed attempt to disable enforcement
    Tamper { event: TamperEvent },

    /// Add or remove a protected package
    ///
    /// Removal needs the current credential once one is set.
    SetProtected {
        package: String,
        protected: bool,
        #[serde(default)]
        current: Option<String>,
    },

    /// Name shown on the challenge surface
    SetDisplayName {
        package: String,
        name: String,
        #[serde(default)]
        current: Option<String>,
    },

    /// Enable or disable the biometric factor
    SetBiometricEnabled {
        enabled: bool,
        #[serde(default)]
        current: Option<String>,
    },

    /// Set or change the knowledge factor
    SetCredential {
        lock_type: LockType,
        credential: String,
        /// Required once a credential exists
        #[serde(default)]
        current: Option<String>,
    },

    /// Remove the knowledge factor
    ResetCredential { current: String },

    /// Stream host commands on this connection
    Subscribe,
}

/// Responses (and pushed host commands) on the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcResponse {
    /// Success with no data
    Ok,

    /// Pong response
    Pong { version: String },

    /// Error response
    Error { message: String },

    Status { status: EngineStatus },

    LockState { package: String, state: LockState },

    /// Outcome of a knowledge-factor submission
    Verified { accepted: bool },

    BiometricStarted { session: SessionId },

    BiometricCancelled { cancelled: bool },

    Retain { retain: bool },

    Tamper { action: TamperAction },

    /// Whether a protected-set update changed anything
    ProtectedChanged { changed: bool },

    /// Host commands follow on this connection
    Subscribed,

    /// Pushed to subscribed connections
    Command { command: HostCommand },
}

impl IpcResponse {
    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            message: message.into(),
        }
    }
}
