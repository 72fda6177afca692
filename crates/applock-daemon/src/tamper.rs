//! Anti-tamper guard
//!
//! Watches for attempts to disable enforcement: removal of the capabilities
//! the foreground backends depend on, and uninstall requests for the
//! controlling application.
//!
//! Losing the capability the active backend runs on is handled whether or not
//! anti-uninstall is on, since enforcement stops without it. Everything else
//! is only acted on under anti-uninstall, where the controlling package is
//! permanently locked.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use applock_core::PackageName;

use crate::config::{Backend, TamperResponse};

/// Host capability enforcement depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Device administrator (blocks uninstall of the controlling app)
    DeviceAdmin,
    /// Accessibility service (window-state events, tamper monitoring)
    Accessibility,
    /// Usage access (recent usage events)
    UsageAccess,
    /// Privileged helper connection
    PrivilegedIpc,
}

impl Capability {
    /// Capability a foreground backend needs
    pub fn for_backend(backend: Backend) -> Capability {
        match backend {
            Backend::Accessibility => Capability::Accessibility,
            Backend::UsageStats => Capability::UsageAccess,
            Backend::PrivilegedIpc => Capability::PrivilegedIpc,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::DeviceAdmin => f.write_str("device_admin"),
            Capability::Accessibility => f.write_str("accessibility"),
            Capability::UsageAccess => f.write_str("usage_access"),
            Capability::PrivilegedIpc => f.write_str("privileged_ipc"),
        }
    }
}

/// Observed attempt to disable enforcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TamperEvent {
    /// The user opened the screen that removes a capability
    RemovalRequested { capability: Capability },
    /// A capability has been revoked
    Revoked { capability: Capability },
    /// Uninstall of a package was requested
    UninstallRequested { package: PackageName },
}

/// What the guard decided
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TamperAction {
    /// Nothing to do (anti-uninstall off or unrelated target)
    Ignored,
    /// Ask the host to grant the capability again
    Reasserted { capability: Capability },
    /// Switch the foreground backend
    Degraded { from: Backend, to: Backend },
    /// Raise the challenge over the controlling application
    ChallengeControllingApp,
}

/// Anti-tamper guard
#[derive(Debug)]
pub struct AntiTamperGuard {
    controlling_package: PackageName,
    backend: Backend,
    response: TamperResponse,
}

impl AntiTamperGuard {
    pub fn new(controlling_package: PackageName, backend: Backend, response: TamperResponse) -> Self {
        Self {
            controlling_package,
            backend,
            response,
        }
    }

    pub fn controlling_package(&self) -> &PackageName {
        &self.controlling_package
    }

    /// Foreground backend currently in use
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Whether `package` may never hold a grant
    pub fn is_permanently_locked(&self, package: &str, anti_uninstall_enabled: bool) -> bool {
        anti_uninstall_enabled && self.controlling_package == package
    }

    /// Decide how to respond to a tamper event
    pub fn handle(&mut self, event: &TamperEvent, anti_uninstall_enabled: bool) -> TamperAction {
        match event {
            TamperEvent::UninstallRequested { package } => {
                if !anti_uninstall_enabled || *package != self.controlling_package {
                    return TamperAction::Ignored;
                }
                warn!("Uninstall of {} requested", package);
                TamperAction::ChallengeControllingApp
            }
            TamperEvent::RemovalRequested { capability } | TamperEvent::Revoked { capability } => {
                if *capability == Capability::for_backend(self.backend) {
                    return self.backend_capability_lost(*capability);
                }
                if !anti_uninstall_enabled {
                    return TamperAction::Ignored;
                }
                warn!("Tamper with {} capability: {:?}", capability, event);
                TamperAction::Reasserted {
                    capability: *capability,
                }
            }
        }
    }

    /// The active backend's capability is going or gone
    fn backend_capability_lost(&mut self, capability: Capability) -> TamperAction {
        warn!("{} backend is losing its {} capability", self.backend, capability);
        if self.response == TamperResponse::Reassert {
            return TamperAction::Reasserted { capability };
        }

        let from = self.backend;
        let Some(to) = from
            .fallbacks()
            .iter()
            .copied()
            .find(|b| Capability::for_backend(*b) != capability)
        else {
            return TamperAction::Reasserted { capability };
        };

        info!("Degrading foreground backend from {} to {}", from, to);
        self.backend = to;
        TamperAction::Degraded { from, to }
    }
}
