//! Component wiring shared by the binary and integration tests

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use applock_core::PackageName;

use crate::auth::{Argon2CredentialStore, AuthOrchestrator};
use crate::config::{EnforcementConfig, SharedPolicy};
use crate::engine::{EngineParts, LockDecisionEngine};
use crate::enforcer::Enforcer;
use crate::error::Result;
use crate::foreground::{Clock, SourceInputs};
use crate::grant_store::GrantStore;
use crate::ipc::IpcContext;
use crate::presenter::{HostBridge, RemoteBiometricPlatform};
use crate::tamper::AntiTamperGuard;

/// A fully wired daemon, not yet running
pub struct Components {
    pub enforcer: Enforcer,
    pub context: IpcContext,
}

/// Build every component from a validated configuration
///
/// `config_path` is where control-socket changes are written back; `None`
/// keeps them in memory.
pub fn assemble(
    config: EnforcementConfig,
    config_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
) -> Result<Components> {
    config.validate()?;

    let controlling = PackageName::new(config.controlling_package.as_str())?;
    let presenter_package = PackageName::new(config.presenter_package.as_str())?;
    let plan = config.boot_plan();

    let policy = Arc::new(SharedPolicy::new(config.clone()));
    let credentials = Arc::new(Argon2CredentialStore::open(config.credential_path.clone())?);
    let bridge = HostBridge::default();
    let biometric = Arc::new(RemoteBiometricPlatform::new(bridge.clone()));

    let engine = LockDecisionEngine::new(EngineParts {
        policy: policy.clone(),
        grants: Arc::new(GrantStore::new()),
        credentials: credentials.clone(),
        presenter: Arc::new(bridge.clone()),
        auth: AuthOrchestrator::new(biometric.clone(), policy.clone()),
        guard: AntiTamperGuard::new(controlling, plan.backend, config.tamper_response),
        presenter_package,
    });

    let inputs = SourceInputs::new(clock.clone(), &config);
    let (enforcer, handle) = Enforcer::new(engine, clock, bridge.clone(), config, inputs.clone());

    info!(
        "Enforcement assembled: {} backend, tamper monitor {}",
        plan.backend,
        if plan.tamper_monitor { "on" } else { "off" }
    );

    Ok(Components {
        enforcer,
        context: IpcContext {
            enforcer: handle,
            policy,
            credentials,
            bridge,
            biometric,
            inputs,
            config_path,
            tamper_monitor: plan.tamper_monitor,
        },
    })
}
