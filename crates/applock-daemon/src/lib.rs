//! AppLock Daemon - Per-application access control enforcement
//!
//! This crate provides:
//! - Foreground detection through accessibility, usage-stats and privileged backends
//! - The lock decision engine and the temporary-unlock grant store
//! - Biometric and knowledge-factor authentication
//! - Anti-tamper handling for the controlling application
//! - A local control socket for hosts and tooling

pub mod auth;
pub mod config;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod foreground;
pub mod grant_store;
pub mod ipc;
pub mod presenter;
pub mod runtime;
pub mod tamper;

pub use auth::{Argon2CredentialStore, AuthError, AuthOrchestrator, CredentialStore};
pub use config::{Backend, EnforcementConfig, LockPolicy, SharedPolicy, TamperResponse};
pub use enforcer::{Enforcer, EnforcerHandle};
pub use engine::{EngineStatus, ForegroundDecision, LockDecisionEngine};
pub use error::{DaemonError, Result};
pub use foreground::{Clock, ForegroundEvent, MonotonicClock};
pub use grant_store::GrantStore;
pub use ipc::{IpcClient, IpcServer};
pub use presenter::{ChallengePresenter, HostBridge, HostCommand};
pub use runtime::{assemble, Components};
pub use tamper::{AntiTamperGuard, TamperAction, TamperEvent};
