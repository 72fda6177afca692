//! Biometric authentication orchestrator
//!
//! Owns the single process-wide [`AuthSession`] and the "auth in progress"
//! counter. All methods take `&mut self`; the enforcer serializes calls, and
//! platform results come back through [`AuthOrchestrator::resolve`] on the
//! same task.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use applock_core::{
    AuthFactor, AuthSession, AuthState, Availability, BiometricError, BiometricErrorKind,
    PackageName, SessionId, Timestamp,
};

use super::platform::{BiometricPlatform, PromptEvent, PromptOutcome, PromptRequest};
use super::AuthError;
use crate::config::LockPolicy;

const PROMPT_SUBTITLE: &str = "Use your fingerprint, face, or device PIN to continue";
const REJECTED_REASON: &str = "Biometric not recognized";

/// Progress reported to the caller of [`AuthOrchestrator::authenticate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUpdate {
    /// Authentication succeeded; the session is over
    Succeeded { package: PackageName },
    /// Sample rejected; the session continues
    Failed { package: PackageName, reason: String },
    /// Session ended with an error or was cancelled
    Errored {
        package: PackageName,
        error: BiometricError,
    },
}

impl AuthUpdate {
    pub fn package(&self) -> &PackageName {
        match self {
            AuthUpdate::Succeeded { package }
            | AuthUpdate::Failed { package, .. }
            | AuthUpdate::Errored { package, .. } => package,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthUpdate::Failed { .. })
    }
}

/// Caller's view of an accepted session
///
/// Updates are delivered in order; at most one terminal update is ever sent.
#[derive(Debug)]
pub struct AuthHandle {
    session: SessionId,
    package: PackageName,
    updates: mpsc::UnboundedReceiver<AuthUpdate>,
}

impl AuthHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn package(&self) -> &PackageName {
        &self.package
    }

    /// Wait for the next update; `None` once the session is gone
    pub async fn next(&mut self) -> Option<AuthUpdate> {
        self.updates.recv().await
    }

    /// Take an update that has already been delivered
    pub fn try_next(&mut self) -> Option<AuthUpdate> {
        self.updates.try_recv().ok()
    }
}

struct ActiveSession {
    session: AuthSession,
    updates: mpsc::UnboundedSender<AuthUpdate>,
}

impl ActiveSession {
    fn notify(&self, update: AuthUpdate) {
        // The caller may have dropped its handle; the engine still acts on the result.
        let _ = self.updates.send(update);
    }
}

/// Snapshot of orchestrator state for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDiagnostics {
    pub availability: Availability,
    pub biometric_enabled: bool,
    pub state: AuthState,
    pub last_outcome: Option<AuthState>,
    pub active_package: Option<PackageName>,
    pub auth_in_progress: bool,
}

/// Coordinates biometric sessions
pub struct AuthOrchestrator {
    platform: Arc<dyn BiometricPlatform>,
    policy: Arc<dyn LockPolicy>,
    state: AuthState,
    active: Option<ActiveSession>,
    next_session: u64,
    in_progress: u32,
    last_outcome: Option<AuthState>,
}

impl AuthOrchestrator {
    pub fn new(platform: Arc<dyn BiometricPlatform>, policy: Arc<dyn LockPolicy>) -> Self {
        Self {
            platform,
            policy,
            state: AuthState::Idle,
            active: None,
            next_session: 1,
            in_progress: 0,
            last_outcome: None,
        }
    }

    /// Whether the biometric factor can be used right now
    pub fn availability(&self) -> Availability {
        if !self.policy.biometric_enabled() {
            return Availability::PolicyDisabled;
        }
        self.platform.availability()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// The in-flight session, if any
    pub fn session(&self) -> Option<&AuthSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    /// True while a prompt may be covering the challenge surface
    pub fn auth_in_progress(&self) -> bool {
        self.in_progress > 0
    }

    /// Start a biometric session for a package
    ///
    /// Returns immediately. Fails without side effects if the factor is
    /// unavailable or disabled, or if a session already exists.
    pub fn authenticate(
        &mut self,
        package: &PackageName,
        display_name: &str,
        now: Timestamp,
    ) -> Result<AuthHandle, AuthError> {
        let availability = self.availability();
        if let Some(kind) = availability.error_kind() {
            warn!("Biometric not available for {}: {}", package, availability);
            return Err(BiometricError::from_kind(kind).into());
        }

        if let Some(active) = self.active.as_ref().filter(|a| a.session.state.is_active()) {
            warn!(
                "Biometric authentication already in progress for {}",
                active.session.target_package
            );
            return Err(AuthError::AlreadyAuthenticating(
                active.session.target_package.clone(),
            ));
        }

        let id = SessionId(self.next_session);
        self.next_session += 1;

        let request = PromptRequest {
            session: id,
            package: package.to_string(),
            title: format!("Unlock {}", display_name),
            subtitle: PROMPT_SUBTITLE.to_string(),
            authenticator: self.platform.strongest_class(),
            allow_device_credential: true,
            confirmation_required: false,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.active = Some(ActiveSession {
            session: AuthSession::new(id, package.clone(), AuthFactor::Biometric, now),
            updates: tx,
        });
        self.state = AuthState::Authenticating;
        self.in_progress += 1;

        if let Err(e) = self.platform.present(&request) {
            error!("Error starting biometric authentication: {}", e);
            self.finish(AuthState::Error);
            let error = BiometricError::new(
                BiometricErrorKind::HardwareUnavailable,
                format!("Failed to start biometric authentication: {}", e.message),
            );
            return Err(error.into());
        }

        info!("Started biometric {} for {}", id, package);
        Ok(AuthHandle {
            session: id,
            package: package.clone(),
            updates: rx,
        })
    }

    /// Apply a platform result
    ///
    /// Results for sessions that are no longer active are dropped, so each
    /// session resolves at most once.
    pub fn resolve(&mut self, event: PromptEvent) -> Option<AuthUpdate> {
        let Some(active) = self.active.as_mut() else {
            debug!("Dropping prompt result for {}: no active session", event.session);
            return None;
        };
        if active.session.id != event.session {
            debug!(
                "Dropping prompt result for stale {} (active {})",
                event.session, active.session.id
            );
            return None;
        }

        let package = active.session.target_package.clone();
        match event.outcome {
            PromptOutcome::Succeeded => {
                info!("Biometric authentication succeeded for {}", package);
                let update = AuthUpdate::Succeeded { package };
                active.notify(update.clone());
                self.finish(AuthState::Success);
                Some(update)
            }
            PromptOutcome::Rejected => {
                warn!("Biometric authentication failed - not recognized");
                active.session.state = AuthState::Failed;
                self.state = AuthState::Failed;
                let update = AuthUpdate::Failed {
                    package,
                    reason: REJECTED_REASON.to_string(),
                };
                active.notify(update.clone());
                Some(update)
            }
            PromptOutcome::Error { kind, message } => {
                let terminal = kind.terminal_state();
                match kind {
                    BiometricErrorKind::UserCancelled => {
                        debug!("User cancelled biometric authentication")
                    }
                    BiometricErrorKind::Lockout | BiometricErrorKind::LockoutPermanent => {
                        warn!("Biometric lockout for {}: {}", package, message)
                    }
                    _ => warn!("Biometric authentication error: {} ({})", message, kind),
                }
                let update = AuthUpdate::Errored {
                    package,
                    error: BiometricError::new(kind, message),
                };
                active.notify(update.clone());
                self.finish(terminal);
                Some(update)
            }
        }
    }

    /// Cancel the in-flight session
    ///
    /// Safe to call from teardown paths with no session; never waits for the
    /// platform prompt to close. Returns true if a session was cancelled.
    pub fn cancel(&mut self) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };

        debug!("Cancelling biometric authentication");
        let id = active.session.id;
        active.notify(AuthUpdate::Errored {
            package: active.session.target_package.clone(),
            error: BiometricError::from_kind(BiometricErrorKind::UserCancelled),
        });
        self.platform.cancel(id);
        self.finish(AuthState::Cancelled);
        true
    }

    /// Cancel only if the in-flight session targets `package`
    pub fn cancel_for(&mut self, package: &str) -> bool {
        match &self.active {
            Some(active) if active.session.target_package == package => self.cancel(),
            _ => false,
        }
    }

    pub fn diagnostics(&self) -> AuthDiagnostics {
        AuthDiagnostics {
            availability: self.availability(),
            biometric_enabled: self.policy.biometric_enabled(),
            state: self.state,
            last_outcome: self.last_outcome,
            active_package: self.session().map(|s| s.target_package.clone()),
            auth_in_progress: self.auth_in_progress(),
        }
    }

    /// Record the terminal state, release the counter, and reset to Idle
    fn finish(&mut self, terminal: AuthState) {
        debug_assert!(terminal.is_terminal(), "{:?} does not end a session", terminal);
        self.last_outcome = Some(terminal);
        self.in_progress = self.in_progress.saturating_sub(1);
        self.active = None;
        self.state = AuthState::Idle;
    }
}
