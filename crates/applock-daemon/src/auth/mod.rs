//! Authentication for locked packages
//!
//! Two factors can satisfy a challenge:
//!
//! - The knowledge factor (PIN or pattern), validated by a [`CredentialStore`].
//!   The core never stores or compares raw credentials itself.
//! - The biometric factor, driven by the [`AuthOrchestrator`] through a
//!   [`BiometricPlatform`]. At most one biometric session exists at a time;
//!   a second request while one is in flight is rejected, never queued.

mod credential;
mod orchestrator;
mod platform;

pub use credential::{Argon2CredentialStore, CredentialStore};
pub use orchestrator::{AuthDiagnostics, AuthHandle, AuthOrchestrator, AuthUpdate};
pub use platform::{BiometricPlatform, PromptEvent, PromptOutcome, PromptRequest};

use applock_core::{BiometricError, PackageName};

/// Reasons an authentication request is refused synchronously
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Biometric factor unusable (availability, policy, or platform failure)
    #[error("Biometric authentication unavailable - {0}")]
    Biometric(#[from] BiometricError),

    /// Another session is still authenticating
    #[error("Authentication already in progress for {0}")]
    AlreadyAuthenticating(PackageName),

    /// The package has no challenge to satisfy
    #[error("No pending challenge for {0}")]
    NoPendingChallenge(String),
}
