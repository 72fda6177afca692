//! Challenge presenter and the host bridge
//!
//! The engine never renders anything. It asks a [`ChallengePresenter`] to
//! show or dismiss the challenge surface, and the daemon implements both the
//! presenter and the [`BiometricPlatform`] by broadcasting [`HostCommand`]s to
//! subscribed host connections.

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use applock_core::{
    AuthenticatorClass, Availability, BiometricError, BiometricErrorKind, PackageName, SessionId,
};

use crate::auth::{BiometricPlatform, PromptRequest};
use crate::tamper::Capability;

/// What the challenge surface should show
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub package: PackageName,
    pub display_name: String,
    /// Offer the biometric button on the surface
    pub show_biometric_option: bool,
}

/// Renders the challenge surface
pub trait ChallengePresenter: Send + Sync {
    /// Show the challenge for a package; returns whether any surface got it
    fn show(&self, request: &ChallengeRequest) -> bool;

    /// Tear down the challenge for a package
    fn dismiss(&self, package: &PackageName);
}

/// Command sent from the daemon to subscribed hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    ShowChallenge(ChallengeRequest),
    DismissChallenge { package: PackageName },
    BiometricPrompt(PromptRequest),
    CancelBiometricPrompt { session: SessionId },
    /// Ask the user to grant an enforcement capability again
    RequestCapability { capability: Capability },
}

/// Fan-out of host commands
#[derive(Debug, Clone)]
pub struct HostBridge {
    tx: broadcast::Sender<HostCommand>,
}

impl HostBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostCommand> {
        self.tx.subscribe()
    }

    /// Whether any host is listening
    pub fn has_hosts(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    /// Broadcast a command; returns the number of hosts that received it
    pub fn send(&self, command: HostCommand) -> usize {
        match self.tx.send(command) {
            Ok(count) => count,
            Err(broadcast::error::SendError(command)) => {
                debug!("No host subscribed, dropping {:?}", command);
                0
            }
        }
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ChallengePresenter for HostBridge {
    fn show(&self, request: &ChallengeRequest) -> bool {
        if self.send(HostCommand::ShowChallenge(request.clone())) == 0 {
            warn!("Challenge for {} raised with no host to show it", request.package);
            return false;
        }
        true
    }

    fn dismiss(&self, package: &PackageName) {
        self.send(HostCommand::DismissChallenge {
            package: package.clone(),
        });
    }
}

/// Biometric platform living in a host process
///
/// Availability is whatever the host last reported; until then the daemon
/// assumes there is no hardware.
#[derive(Debug)]
pub struct RemoteBiometricPlatform {
    bridge: HostBridge,
    status: RwLock<(Availability, AuthenticatorClass)>,
}

impl RemoteBiometricPlatform {
    pub fn new(bridge: HostBridge) -> Self {
        Self {
            bridge,
            status: RwLock::new((Availability::NoHardware, AuthenticatorClass::default())),
        }
    }

    /// Record availability reported by the host
    pub fn set_availability(&self, availability: Availability, class: AuthenticatorClass) {
        debug!("Host reported biometric availability {} ({:?})", availability, class);
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = (availability, class);
    }
}

impl BiometricPlatform for RemoteBiometricPlatform {
    fn availability(&self) -> Availability {
        self.status.read().unwrap_or_else(PoisonError::into_inner).0
    }

    fn strongest_class(&self) -> AuthenticatorClass {
        self.status.read().unwrap_or_else(PoisonError::into_inner).1
    }

    fn present(&self, request: &PromptRequest) -> Result<(), BiometricError> {
        if self.bridge.send(HostCommand::BiometricPrompt(request.clone())) == 0 {
            return Err(BiometricError::new(
                BiometricErrorKind::HardwareUnavailable,
                "no biometric host connected",
            ));
        }
        Ok(())
    }

    fn cancel(&self, session: SessionId) {
        self.bridge.send(HostCommand::CancelBiometricPrompt { session });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChallengeRequest {
        ChallengeRequest {
            package: PackageName::new("com.example.bank").unwrap(),
            display_name: "Bank".into(),
            show_biometric_option: true,
        }
    }

    #[test]
    fn test_send_without_hosts() {
        let bridge = HostBridge::default();
        assert!(!bridge.has_hosts());
        assert_eq!(bridge.send(HostCommand::ShowChallenge(request())), 0);
        assert!(!bridge.show(&request()));

        let host = bridge.subscribe();
        assert!(bridge.has_hosts());
        assert!(bridge.show(&request()));
        drop(host);
        assert!(!bridge.has_hosts());
    }

    #[tokio::test]
    async fn test_presenter_broadcasts() {
        let bridge = HostBridge::default();
        let mut rx = bridge.subscribe();

        assert!(bridge.show(&request()));
        bridge.dismiss(&request().package);

        assert_eq!(rx.recv().await.unwrap(), HostCommand::ShowChallenge(request()));
        assert!(matches!(
            rx.recv().await.unwrap(),
            HostCommand::DismissChallenge { package } if package == "com.example.bank"
        ));
    }

    #[test]
    fn test_remote_platform_requires_host() {
        let bridge = HostBridge::default();
        let platform = RemoteBiometricPlatform::new(bridge.clone());
        assert_eq!(platform.availability(), Availability::NoHardware);

        platform.set_availability(Availability::Available, AuthenticatorClass::BiometricWeak);
        assert_eq!(platform.availability(), Availability::Available);
        assert_eq!(platform.strongest_class(), AuthenticatorClass::BiometricWeak);

        let prompt = PromptRequest {
            session: SessionId(1),
            package: "com.example.bank".into(),
            title: "Unlock Bank".into(),
            subtitle: String::new(),
            authenticator: AuthenticatorClass::BiometricWeak,
            allow_device_credential: true,
            confirmation_required: false,
        };
        let err = platform.present(&prompt).unwrap_err();
        assert_eq!(err.kind, BiometricErrorKind::HardwareUnavailable);

        let mut rx = bridge.subscribe();
        platform.present(&prompt).unwrap();
        assert_eq!(rx.try_recv().unwrap(), HostCommand::BiometricPrompt(prompt));
    }

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(HostCommand::CancelBiometricPrompt {
            session: SessionId(4),
        })
        .unwrap();
        assert_eq!(json["command"], "cancel_biometric_prompt");
        assert_eq!(json["session"], 4);
    }
}
