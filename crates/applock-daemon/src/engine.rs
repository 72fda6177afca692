//! Lock Decision Engine
//!
//! Maps foreground changes to per-package lock states and drives the
//! challenge surface. The engine is synchronous and owned by a single task
//! (the [`Enforcer`](crate::enforcer::Enforcer)); the grant store is the only
//! piece shared with other readers.
//!
//! State per protected package:
//!
//! - `ChallengePending`: the package is in the pending set.
//! - `TemporarilyUnlocked`: the grant store holds an unexpired grant, or the
//!   package holds the foreground session (see below).
//! - `Locked`: anything else.
//!
//! Only one challenge is displayed at a time. When a second protected package
//! takes the foreground while the first is pending, the display pointer moves
//! and the first package reverts to `Locked`.
//!
//! A foreground session is an unlock that lasts until another package takes
//! the foreground. It is used for the controlling package under anti-uninstall
//! (which never receives a grant) and for unlocks with a zero grace interval.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use applock_core::{
    AuthFactor, KnowledgeFactor, LockState, PackageName, Timestamp, UnlockGrant,
};

use crate::auth::{
    AuthDiagnostics, AuthError, AuthHandle, AuthOrchestrator, AuthUpdate, CredentialStore,
    PromptEvent,
};
use crate::config::{Backend, LockPolicy};
use crate::grant_store::{GrantStatus, GrantStore};
use crate::presenter::{ChallengePresenter, ChallengeRequest};
use crate::tamper::{AntiTamperGuard, TamperAction, TamperEvent};

/// Why a foreground event was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The challenge surface itself
    Presenter,
    /// Package not under enforcement
    NotProtected,
}

/// Outcome of a foreground change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ForegroundDecision {
    Ignored { reason: IgnoreReason },
    /// Access allowed; `grant_expiry` is `None` for a foreground session
    Unlocked { grant_expiry: Option<Timestamp> },
    /// New challenge shown
    ChallengeRaised { auto_biometric: bool },
    /// Pending challenge shown again after its surface was torn down
    ChallengeReshown { auto_biometric: bool },
    /// Challenge already on screen
    AlreadyPending,
}

impl ForegroundDecision {
    pub fn raised_challenge(&self) -> bool {
        matches!(
            self,
            ForegroundDecision::ChallengeRaised { .. } | ForegroundDecision::ChallengeReshown { .. }
        )
    }
}

/// Snapshot of engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub foreground: Option<PackageName>,
    pub displayed: Option<PackageName>,
    pub presenter_visible: bool,
    pub pending: Vec<PackageName>,
    pub grants: Vec<UnlockGrant>,
    pub foreground_session: Option<PackageName>,
    pub backend: Backend,
    pub auth: AuthDiagnostics,
}

/// Collaborators the engine is built from
pub struct EngineParts {
    pub policy: Arc<dyn LockPolicy>,
    pub grants: Arc<GrantStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub presenter: Arc<dyn ChallengePresenter>,
    pub auth: AuthOrchestrator,
    pub guard: AntiTamperGuard,
    pub presenter_package: PackageName,
}

/// Per-package lock state machine
pub struct LockDecisionEngine {
    policy: Arc<dyn LockPolicy>,
    grants: Arc<GrantStore>,
    credentials: Arc<dyn CredentialStore>,
    presenter: Arc<dyn ChallengePresenter>,
    auth: AuthOrchestrator,
    guard: AntiTamperGuard,
    presenter_package: PackageName,

    pending: BTreeSet<PackageName>,
    /// Package whose challenge owns the surface
    displayed: Option<PackageName>,
    presenter_visible: bool,
    /// Biometric already auto-prompted for the displayed challenge
    auto_prompted: bool,
    foreground: Option<PackageName>,
    foreground_session: Option<PackageName>,
}

impl LockDecisionEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            policy: parts.policy,
            grants: parts.grants,
            credentials: parts.credentials,
            presenter: parts.presenter,
            auth: parts.auth,
            guard: parts.guard,
            presenter_package: parts.presenter_package,
            pending: BTreeSet::new(),
            displayed: None,
            presenter_visible: false,
            auto_prompted: false,
            foreground: None,
            foreground_session: None,
        }
    }

    pub fn grants(&self) -> &Arc<GrantStore> {
        &self.grants
    }

    pub fn auth(&self) -> &AuthOrchestrator {
        &self.auth
    }

    pub fn guard(&self) -> &AntiTamperGuard {
        &self.guard
    }

    /// Whether the package is under enforcement right now
    pub fn is_protected(&self, package: &str) -> bool {
        if self.presenter_package == package {
            return false;
        }
        self.policy.is_protected(package) || self.is_permanently_locked(package)
    }

    fn is_permanently_locked(&self, package: &str) -> bool {
        self.guard
            .is_permanently_locked(package, self.policy.anti_uninstall_enabled())
    }

    /// Lock state of a package as observed at `now`
    pub fn lock_state(&self, package: &str, now: Timestamp) -> LockState {
        if self.pending.contains(package) {
            return LockState::ChallengePending;
        }
        if self.foreground_session.as_ref().is_some_and(|p| p == package) {
            return LockState::TemporarilyUnlocked {
                grant_expiry: Timestamp::MAX,
            };
        }
        match self.grants.get(package) {
            Some(grant) => LockState::TemporarilyUnlocked {
                grant_expiry: grant.expiry,
            }
            .at(now),
            None => LockState::Locked,
        }
    }

    /// React to a package coming to the foreground
    pub fn on_foreground_changed(
        &mut self,
        package: &PackageName,
        now: Timestamp,
    ) -> ForegroundDecision {
        // The challenge surface reporting itself must not look like the user
        // leaving the locked package.
        if *package == self.presenter_package {
            debug!("Ignoring foreground event from challenge surface");
            return ForegroundDecision::Ignored {
                reason: IgnoreReason::Presenter,
            };
        }

        self.foreground = Some(package.clone());
        if let Some(session) = &self.foreground_session {
            if session != package {
                debug!("{} left the foreground, ending its session", session);
                self.foreground_session = None;
            }
        }

        if !self.is_protected(package.as_str()) {
            return ForegroundDecision::Ignored {
                reason: IgnoreReason::NotProtected,
            };
        }

        if self.foreground_session.as_ref() == Some(package) {
            return ForegroundDecision::Unlocked { grant_expiry: None };
        }

        if !self.is_permanently_locked(package.as_str()) {
            match self.grants.check(package.as_str(), now) {
                GrantStatus::Valid(grant) => {
                    debug!(
                        "{} unlocked until {} ({:?} left)",
                        package,
                        grant.expiry,
                        grant.remaining(now)
                    );
                    return ForegroundDecision::Unlocked {
                        grant_expiry: Some(grant.expiry),
                    };
                }
                GrantStatus::Expired(grant) => {
                    info!("Grant for {} expired at {}, locking", package, grant.expiry);
                }
                GrantStatus::Absent => {}
            }
        }

        if self.pending.contains(package) {
            // A surface that never reached a host counts as closed
            if self.displayed.as_ref() == Some(package) && self.presenter_visible {
                return ForegroundDecision::AlreadyPending;
            }
            let auto_biometric = self.display_challenge(package, now);
            info!("Re-showing pending challenge for {}", package);
            return ForegroundDecision::ChallengeReshown { auto_biometric };
        }

        info!("Locking {}", package);
        self.pending.insert(package.clone());
        let auto_biometric = self.display_challenge(package, now);
        ForegroundDecision::ChallengeRaised { auto_biometric }
    }

    /// Point the surface at `package` and show it
    fn display_challenge(&mut self, package: &PackageName, now: Timestamp) -> bool {
        if let Some(previous) = self.displayed.take() {
            if previous != *package {
                self.revert_to_locked(&previous);
                if self.presenter_visible {
                    self.presenter.dismiss(&previous);
                }
                self.auto_prompted = false;
            }
        }

        let availability = self.auth.availability();
        let request = ChallengeRequest {
            package: package.clone(),
            display_name: self.policy.display_name(package.as_str()),
            show_biometric_option: availability.is_available(),
        };
        self.displayed = Some(package.clone());
        self.presenter_visible = self.presenter.show(&request);

        if !request.show_biometric_option || self.auto_prompted {
            return false;
        }
        self.auto_prompted = true;
        match self
            .auth
            .authenticate(package, &request.display_name, now)
        {
            Ok(handle) => {
                debug!("Auto-prompting biometric ({})", handle.session());
                true
            }
            Err(e) => {
                debug!("Skipping biometric auto-prompt for {}: {}", package, e);
                false
            }
        }
    }

    /// Drop a pending challenge back to `Locked`
    fn revert_to_locked(&mut self, package: &PackageName) {
        if self.pending.remove(package) {
            debug!("{} lost display precedence, reverting to locked", package);
        }
        self.auth.cancel_for(package.as_str());
    }

    /// Validate a knowledge-factor candidate for a pending challenge
    ///
    /// Malformed candidates and credential-store failures are denials.
    pub fn submit_knowledge_factor(
        &mut self,
        package: &str,
        candidate: &str,
        now: Timestamp,
    ) -> Result<bool, AuthError> {
        let Some(package) = self.pending.get(package).cloned() else {
            return Err(AuthError::NoPendingChallenge(package.to_string()));
        };

        let factor = match KnowledgeFactor::parse(self.policy.lock_type(), candidate) {
            Ok(factor) => factor,
            Err(e) => {
                warn!("Rejected malformed credential for {}: {}", package, e);
                return Ok(false);
            }
        };

        match self.credentials.validate(&factor) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Incorrect credential for {}", package);
                return Ok(false);
            }
            Err(e) => {
                error!("Credential check failed for {}: {}", package, e);
                return Ok(false);
            }
        }

        if self.auth.cancel_for(package.as_str()) {
            debug!("Knowledge factor accepted, cancelled biometric for {}", package);
        }
        self.unlock(&package, AuthFactor::Knowledge, now);
        Ok(true)
    }

    /// Start a biometric session for a pending challenge
    pub fn request_biometric(
        &mut self,
        package: &str,
        now: Timestamp,
    ) -> Result<AuthHandle, AuthError> {
        let Some(package) = self.pending.get(package).cloned() else {
            return Err(AuthError::NoPendingChallenge(package.to_string()));
        };
        let display_name = self.policy.display_name(package.as_str());
        self.auth.authenticate(&package, &display_name, now)
    }

    /// Cancel the in-flight biometric session, if any
    pub fn cancel_biometric(&mut self) -> bool {
        self.auth.cancel()
    }

    /// Apply a biometric prompt result
    pub fn handle_prompt_event(&mut self, event: PromptEvent, now: Timestamp) -> Option<AuthUpdate> {
        let update = self.auth.resolve(event)?;
        match &update {
            AuthUpdate::Succeeded { package } => {
                if self.pending.contains(package) {
                    self.unlock(package, AuthFactor::Biometric, now);
                } else {
                    warn!("Biometric success for {} with no pending challenge", package);
                }
            }
            AuthUpdate::Errored { package, error } if error.kind.suggests_knowledge_fallback() => {
                info!("Biometric gave up on {}, knowledge factor still accepted", package);
            }
            _ => {}
        }
        Some(update)
    }

    /// Record a successful authentication
    fn unlock(&mut self, package: &PackageName, origin: AuthFactor, now: Timestamp) {
        self.pending.remove(package);

        if self.is_permanently_locked(package.as_str()) {
            info!("{} unlocked for this foreground session", package);
            self.foreground_session = Some(package.clone());
        } else {
            let grace = self.policy.grace_interval();
            let grant = self.grants.put(package.clone(), now.saturating_add(grace), origin);
            if grace.is_zero() {
                self.foreground_session = Some(package.clone());
            }
            info!("{} unlocked by {} until {}", package, origin, grant.expiry);
        }

        if self.displayed.as_ref() == Some(package) {
            self.displayed = None;
            self.presenter_visible = false;
            self.auto_prompted = false;
        }
        self.presenter.dismiss(package);
    }

    /// The host tore down the challenge surface
    ///
    /// The challenge stays pending and is shown again on the next foreground
    /// event for the package.
    pub fn on_presenter_closed(&mut self, package: &str) {
        if self.displayed.as_ref().is_some_and(|p| p == package) {
            debug!("Challenge surface for {} closed", package);
            self.presenter_visible = false;
        }
        self.auth.cancel_for(package);
    }

    /// A host subscribed; show it the displayed challenge if nobody has it
    pub fn on_host_attached(&mut self, now: Timestamp) -> bool {
        if self.presenter_visible {
            return false;
        }
        let Some(package) = self.displayed.clone() else {
            return false;
        };
        if !self.pending.contains(&package) {
            return false;
        }
        info!("Host attached, showing pending challenge for {}", package);
        self.display_challenge(&package, now);
        self.presenter_visible
    }

    /// The last host went away
    ///
    /// Whatever it was showing is gone, so the displayed challenge is treated
    /// as closed and any biometric prompt it ran is abandoned.
    pub fn on_host_detached(&mut self) {
        if let Some(package) = &self.displayed {
            debug!("Host for {} challenge detached", package);
            self.presenter_visible = false;
        }
        if self.auth.cancel() {
            debug!("Cancelled biometric session with its host");
        }
    }

    /// Whether the host should keep the challenge surface alive on pause
    pub fn retain_presenter(&self) -> bool {
        self.auth.auth_in_progress()
    }

    /// The protected set changed; every grant is dropped
    pub fn on_protected_set_changed(&mut self) {
        self.grants.invalidate_all();
        self.foreground_session = None;

        let unprotected: Vec<_> = self
            .pending
            .iter()
            .filter(|p| !self.is_protected(p.as_str()))
            .cloned()
            .collect();
        for package in unprotected {
            info!("{} no longer protected, dropping challenge", package);
            self.pending.remove(&package);
            self.auth.cancel_for(package.as_str());
            if self.displayed.as_ref() == Some(&package) {
                self.displayed = None;
                self.presenter_visible = false;
                self.auto_prompted = false;
                self.presenter.dismiss(&package);
            }
        }
    }

    /// The knowledge factor was reset or its type changed
    pub fn on_lock_type_reset(&mut self) {
        let dropped = self.grants.invalidate_all();
        self.foreground_session = None;
        info!("Credential changed, invalidated {} grants", dropped);
    }

    /// Apply a tamper event
    ///
    /// Under anti-uninstall any acted-on event ends a foreground session of
    /// the controlling package; an uninstall request also raises its
    /// challenge.
    pub fn handle_tamper(&mut self, event: &TamperEvent, now: Timestamp) -> TamperAction {
        let anti_uninstall = self.policy.anti_uninstall_enabled();
        let action = self.guard.handle(event, anti_uninstall);
        if action == TamperAction::Ignored || !anti_uninstall {
            return action;
        }

        let controlling = self.guard.controlling_package().clone();
        if self.foreground_session.as_ref() == Some(&controlling) {
            info!("Re-locking {}", controlling);
            self.foreground_session = None;
        }

        if action == TamperAction::ChallengeControllingApp {
            self.pending.insert(controlling.clone());
            self.display_challenge(&controlling, now);
        }
        action
    }

    pub fn status(&self, now: Timestamp) -> EngineStatus {
        EngineStatus {
            foreground: self.foreground.clone(),
            displayed: self.displayed.clone(),
            presenter_visible: self.presenter_visible,
            pending: self.pending.iter().cloned().collect(),
            grants: self.grants.live_grants(now),
            foreground_session: self.foreground_session.clone(),
            backend: self.guard.backend(),
            auth: self.auth.diagnostics(),
        }
    }
}
