//! Enforcer actor
//!
//! Owns the [`LockDecisionEngine`] and processes foreground events, biometric
//! results and control commands one at a time on a single task. Other tasks
//! talk to it through a cloneable [`EnforcerHandle`].

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use applock_core::{LockState, SessionId};

use crate::auth::{AuthError, PromptEvent};
use crate::config::{Backend, EnforcementConfig};
use crate::engine::{EngineStatus, LockDecisionEngine};
use crate::error::{DaemonError, Result};
use crate::foreground::{build_source, Clock, ForegroundEvent, SourceInputs};
use crate::presenter::{HostBridge, HostCommand};
use crate::tamper::{TamperAction, TamperEvent};

const CHANNEL_CAPACITY: usize = 64;

/// Requests handled on the enforcer task
pub enum EnforcerCommand {
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    LockState {
        package: String,
        reply: oneshot::Sender<LockState>,
    },
    SubmitKnowledgeFactor {
        package: String,
        candidate: zeroize::Zeroizing<String>,
        reply: oneshot::Sender<std::result::Result<bool, AuthError>>,
    },
    RequestBiometric {
        package: String,
        reply: oneshot::Sender<std::result::Result<SessionId, AuthError>>,
    },
    CancelBiometric {
        reply: oneshot::Sender<bool>,
    },
    PresenterClosed {
        package: String,
    },
    RetainPresenter {
        reply: oneshot::Sender<bool>,
    },
    Tamper {
        event: TamperEvent,
        reply: oneshot::Sender<TamperAction>,
    },
    ProtectedSetChanged,
    LockTypeReset,
    HostAttached,
    HostDetached,
}

/// Cloneable handle to the enforcer task
#[derive(Debug, Clone)]
pub struct EnforcerHandle {
    commands: mpsc::Sender<EnforcerCommand>,
    prompts: mpsc::Sender<PromptEvent>,
}

impl EnforcerHandle {
    async fn send(&self, command: EnforcerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DaemonError::EnforcerStopped)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EnforcerCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| DaemonError::EnforcerStopped)
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        self.call(|reply| EnforcerCommand::Status { reply }).await
    }

    pub async fn lock_state(&self, package: &str) -> Result<LockState> {
        let package = package.to_string();
        self.call(|reply| EnforcerCommand::LockState { package, reply })
            .await
    }

    pub async fn submit_knowledge_factor(
        &self,
        package: &str,
        candidate: zeroize::Zeroizing<String>,
    ) -> Result<std::result::Result<bool, AuthError>> {
        let package = package.to_string();
        self.call(|reply| EnforcerCommand::SubmitKnowledgeFactor {
            package,
            candidate,
            reply,
        })
        .await
    }

    pub async fn request_biometric(
        &self,
        package: &str,
    ) -> Result<std::result::Result<SessionId, AuthError>> {
        let package = package.to_string();
        self.call(|reply| EnforcerCommand::RequestBiometric { package, reply })
            .await
    }

    pub async fn cancel_biometric(&self) -> Result<bool> {
        self.call(|reply| EnforcerCommand::CancelBiometric { reply })
            .await
    }

    /// Deliver a biometric prompt result
    pub async fn prompt_result(&self, event: PromptEvent) -> Result<()> {
        self.prompts
            .send(event)
            .await
            .map_err(|_| DaemonError::EnforcerStopped)
    }

    pub async fn presenter_closed(&self, package: &str) -> Result<()> {
        self.send(EnforcerCommand::PresenterClosed {
            package: package.to_string(),
        })
        .await
    }

    pub async fn retain_presenter(&self) -> Result<bool> {
        self.call(|reply| EnforcerCommand::RetainPresenter { reply })
            .await
    }

    pub async fn tamper(&self, event: TamperEvent) -> Result<TamperAction> {
        self.call(|reply| EnforcerCommand::Tamper { event, reply })
            .await
    }

    pub async fn protected_set_changed(&self) -> Result<()> {
        self.send(EnforcerCommand::ProtectedSetChanged).await
    }

    pub async fn lock_type_reset(&self) -> Result<()> {
        self.send(EnforcerCommand::LockTypeReset).await
    }

    /// A host subscribed to challenge commands
    pub async fn host_attached(&self) -> Result<()> {
        self.send(EnforcerCommand::HostAttached).await
    }

    /// The last subscribed host disconnected
    pub async fn host_detached(&self) -> Result<()> {
        self.send(EnforcerCommand::HostDetached).await
    }
}

/// The event-processing actor
pub struct Enforcer {
    engine: LockDecisionEngine,
    clock: Arc<dyn Clock>,
    bridge: HostBridge,
    config: EnforcementConfig,
    inputs: SourceInputs,
    foreground_tx: mpsc::Sender<ForegroundEvent>,
    foreground_rx: mpsc::Receiver<ForegroundEvent>,
    prompt_rx: mpsc::Receiver<PromptEvent>,
    command_rx: mpsc::Receiver<EnforcerCommand>,
    source: Option<JoinHandle<()>>,
}

impl Enforcer {
    /// Build the actor and its handle
    ///
    /// `config` provides the settings foreground sources are built from.
    pub fn new(
        engine: LockDecisionEngine,
        clock: Arc<dyn Clock>,
        bridge: HostBridge,
        config: EnforcementConfig,
        inputs: SourceInputs,
    ) -> (Self, EnforcerHandle) {
        let (foreground_tx, foreground_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (prompt_tx, prompt_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let enforcer = Self {
            engine,
            clock,
            bridge,
            config,
            inputs,
            foreground_tx,
            foreground_rx,
            prompt_rx,
            command_rx,
            source: None,
        };
        let handle = EnforcerHandle {
            commands: command_tx,
            prompts: prompt_tx,
        };
        (enforcer, handle)
    }

    /// Sender for foreground events produced outside the managed source
    pub fn foreground_sender(&self) -> mpsc::Sender<ForegroundEvent> {
        self.foreground_tx.clone()
    }

    /// Start (or replace) the foreground source for a backend
    fn start_source(&mut self, backend: Backend) {
        if let Some(task) = self.source.take() {
            task.abort();
        }

        let source = build_source(backend, &self.config, &self.inputs);
        let sink = self.foreground_tx.clone();
        info!("Starting {} foreground source", backend);
        self.source = Some(tokio::spawn(async move {
            if let Err(e) = source.run(sink).await {
                error!("Foreground source {} failed: {}", backend, e);
            }
        }));
    }

    /// Run until every handle is dropped
    pub async fn run(mut self) {
        let backend = self.engine.guard().backend();
        self.start_source(backend);

        loop {
            // Events queued before a command are applied before it
            tokio::select! {
                biased;
                Some(event) = self.foreground_rx.recv() => {
                    let now = self.clock.now();
                    let decision = self.engine.on_foreground_changed(&event.package, now);
                    debug!("{} via {}: {:?}", event.package, event.backend, decision);
                }
                Some(event) = self.prompt_rx.recv() => {
                    let now = self.clock.now();
                    if let Some(update) = self.engine.handle_prompt_event(event, now) {
                        debug!("Biometric update: {:?}", update);
                    }
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        if let Some(task) = self.source.take() {
            task.abort();
        }
        self.engine.cancel_biometric();
        info!("Enforcer stopped");
    }

    fn handle_command(&mut self, command: EnforcerCommand) {
        let now = self.clock.now();
        match command {
            EnforcerCommand::Status { reply } => {
                let _ = reply.send(self.engine.status(now));
            }
            EnforcerCommand::LockState { package, reply } => {
                let _ = reply.send(self.engine.lock_state(&package, now));
            }
            EnforcerCommand::SubmitKnowledgeFactor {
                package,
                candidate,
                reply,
            } => {
                let result = self
                    .engine
                    .submit_knowledge_factor(&package, &candidate, now);
                let _ = reply.send(result);
            }
            EnforcerCommand::RequestBiometric { package, reply } => {
                let result = self
                    .engine
                    .request_biometric(&package, now)
                    .map(|handle| handle.session());
                let _ = reply.send(result);
            }
            EnforcerCommand::CancelBiometric { reply } => {
                let _ = reply.send(self.engine.cancel_biometric());
            }
            EnforcerCommand::PresenterClosed { package } => {
                self.engine.on_presenter_closed(&package);
            }
            EnforcerCommand::RetainPresenter { reply } => {
                let _ = reply.send(self.engine.retain_presenter());
            }
            EnforcerCommand::Tamper { event, reply } => {
                let action = self.engine.handle_tamper(&event, now);
                match &action {
                    TamperAction::Reasserted { capability } => {
                        self.bridge.send(HostCommand::RequestCapability {
                            capability: *capability,
                        });
                    }
                    TamperAction::Degraded { to, .. } => {
                        warn!("Switching foreground backend to {}", to);
                        self.start_source(*to);
                    }
                    TamperAction::Ignored | TamperAction::ChallengeControllingApp => {}
                }
                let _ = reply.send(action);
            }
            EnforcerCommand::ProtectedSetChanged => self.engine.on_protected_set_changed(),
            EnforcerCommand::LockTypeReset => self.engine.on_lock_type_reset(),
            EnforcerCommand::HostAttached => {
                self.engine.on_host_attached(now);
            }
            EnforcerCommand::HostDetached => {
                // Another host may have subscribed since the detach was sent
                if !self.bridge.has_hosts() {
                    self.engine.on_host_detached();
                }
            }
        }
    }
}

/// Spawn the enforcer on the current runtime
pub fn spawn(enforcer: Enforcer) -> JoinHandle<()> {
    tokio::spawn(enforcer.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthOrchestrator, CredentialStore, PromptOutcome};
    use crate::config::LockPolicy;
    use crate::engine::EngineParts;
    use crate::foreground::MonotonicClock;
    use crate::grant_store::GrantStore;
    use crate::presenter::RemoteBiometricPlatform;
    use crate::tamper::{AntiTamperGuard, Capability};
    use applock_core::{AuthenticatorClass, Availability, KnowledgeFactor, PackageName};

    struct AcceptAll;

    impl CredentialStore for AcceptAll {
        fn validate(&self, _candidate: &KnowledgeFactor) -> Result<bool> {
            Ok(true)
        }
    }

    fn start(config: EnforcementConfig) -> (EnforcerHandle, SourceInputs, HostBridge) {
        let policy: Arc<dyn LockPolicy> = Arc::new(config.clone());
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let bridge = HostBridge::default();
        let platform = Arc::new(RemoteBiometricPlatform::new(bridge.clone()));
        platform.set_availability(Availability::Available, AuthenticatorClass::BiometricStrong);

        let engine = LockDecisionEngine::new(EngineParts {
            policy: policy.clone(),
            grants: Arc::new(GrantStore::new()),
            credentials: Arc::new(AcceptAll),
            presenter: Arc::new(bridge.clone()),
            auth: AuthOrchestrator::new(platform, policy),
            guard: AntiTamperGuard::new(
                PackageName::new(config.controlling_package.as_str()).unwrap(),
                config.backend,
                config.tamper_response,
            ),
            presenter_package: PackageName::new(config.presenter_package.as_str()).unwrap(),
        });
        let inputs = SourceInputs::new(clock.clone(), &config);
        let (enforcer, handle) = Enforcer::new(engine, clock, bridge.clone(), config, inputs.clone());
        spawn(enforcer);
        (handle, inputs, bridge)
    }

    fn config() -> EnforcementConfig {
        let mut config = EnforcementConfig {
            grace_interval_secs: 60,
            biometric_enabled: true,
            anti_uninstall_enabled: true,
            ..Default::default()
        };
        config.protected_packages.insert("com.example.bank".into());
        config
    }

    #[tokio::test]
    async fn test_accessibility_event_raises_challenge() {
        let (handle, inputs, bridge) = start(config());
        let mut host = bridge.subscribe();

        // Let the accessibility source subscribe before publishing
        tokio::task::yield_now().await;
        while handle.status().await.unwrap().foreground.is_none() {
            inputs.accessibility.publish(crate::foreground::AccessibilityEvent {
                kind: crate::foreground::WindowEventKind::WindowStateChanged,
                package: "com.example.bank".into(),
                class_name: None,
            });
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(matches!(host.recv().await.unwrap(), HostCommand::ShowChallenge(req) if req.package == "com.example.bank"));
        let session = match host.recv().await.unwrap() {
            HostCommand::BiometricPrompt(prompt) => prompt.session,
            other => panic!("unexpected command: {:?}", other),
        };
        assert!(handle.retain_presenter().await.unwrap());

        handle
            .prompt_result(PromptEvent::new(session, PromptOutcome::Succeeded))
            .await
            .unwrap();
        assert!(matches!(
            handle.lock_state("com.example.bank").await.unwrap(),
            LockState::TemporarilyUnlocked { .. }
        ));
        assert!(matches!(
            host.recv().await.unwrap(),
            HostCommand::DismissChallenge { package } if package == "com.example.bank"
        ));
    }

    #[tokio::test]
    async fn test_challenge_reaches_late_host() {
        let (handle, inputs, bridge) = start(config());

        // Raised while no host is subscribed
        tokio::task::yield_now().await;
        while handle.status().await.unwrap().foreground.is_none() {
            inputs.accessibility.publish(crate::foreground::AccessibilityEvent {
                kind: crate::foreground::WindowEventKind::WindowStateChanged,
                package: "com.example.bank".into(),
                class_name: None,
            });
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let status = handle.status().await.unwrap();
        assert_eq!(status.pending, vec![PackageName::new("com.example.bank").unwrap()]);
        assert!(!status.presenter_visible);

        let mut host = bridge.subscribe();
        handle.host_attached().await.unwrap();
        assert!(handle.status().await.unwrap().presenter_visible);
        assert!(matches!(
            host.try_recv().unwrap(),
            HostCommand::ShowChallenge(req) if req.package == "com.example.bank"
        ));

        drop(host);
        handle.host_detached().await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(!status.presenter_visible);
        assert_eq!(
            handle.lock_state("com.example.bank").await.unwrap(),
            LockState::ChallengePending
        );
    }

    #[tokio::test]
    async fn test_submit_without_challenge_reports_error() {
        let (handle, _inputs, _bridge) = start(config());
        let result = handle
            .submit_knowledge_factor("com.example.bank", zeroize::Zeroizing::new("123456".into()))
            .await
            .unwrap();
        assert_eq!(
            result,
            Err(AuthError::NoPendingChallenge("com.example.bank".into()))
        );
    }

    #[tokio::test]
    async fn test_tamper_reassert_requests_capability() {
        let (handle, _inputs, bridge) = start(config());
        let mut host = bridge.subscribe();

        let action = handle
            .tamper(TamperEvent::RemovalRequested {
                capability: Capability::DeviceAdmin,
            })
            .await
            .unwrap();
        assert_eq!(
            action,
            TamperAction::Reasserted {
                capability: Capability::DeviceAdmin
            }
        );
        assert_eq!(
            host.recv().await.unwrap(),
            HostCommand::RequestCapability {
                capability: Capability::DeviceAdmin
            }
        );
    }

    #[tokio::test]
    async fn test_stops_when_handles_dropped() {
        let config = config();
        let policy: Arc<dyn LockPolicy> = Arc::new(config.clone());
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let bridge = HostBridge::default();
        let engine = LockDecisionEngine::new(EngineParts {
            policy: policy.clone(),
            grants: Arc::new(GrantStore::new()),
            credentials: Arc::new(AcceptAll),
            presenter: Arc::new(bridge.clone()),
            auth: AuthOrchestrator::new(
                Arc::new(RemoteBiometricPlatform::new(bridge.clone())),
                policy,
            ),
            guard: AntiTamperGuard::new(
                PackageName::new("dev.applock").unwrap(),
                Backend::UsageStats,
                config.tamper_response,
            ),
            presenter_package: PackageName::new("dev.applock.challenge").unwrap(),
        });
        let inputs = SourceInputs::new(clock.clone(), &config);
        let (enforcer, handle) = Enforcer::new(engine, clock, bridge, config, inputs);
        let task = spawn(enforcer);

        drop(handle);
        task.await.unwrap();
    }
}
