//! Control socket server

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use applock_core::{KnowledgeFactor, PackageName};

use crate::auth::{Argon2CredentialStore, CredentialStore};
use crate::config::{LockPolicy, SharedPolicy};
use crate::enforcer::EnforcerHandle;
use crate::error::Result;
use crate::foreground::{SourceInputs, UsageEvent};
use crate::presenter::{HostBridge, HostCommand, RemoteBiometricPlatform};
use crate::tamper::{Capability, TamperAction};

use super::connection::{PlatformListener, SocketListener};
use super::types::{IpcRequest, IpcResponse};

/// Everything a connection needs to serve requests
#[derive(Clone)]
pub struct IpcContext {
    pub enforcer: EnforcerHandle,
    pub policy: Arc<SharedPolicy>,
    pub credentials: Arc<Argon2CredentialStore>,
    pub bridge: HostBridge,
    pub biometric: Arc<RemoteBiometricPlatform>,
    pub inputs: SourceInputs,
    /// Where configuration changes are persisted
    pub config_path: Option<PathBuf>,
    /// Ask new hosts to keep the accessibility monitor running
    pub tamper_monitor: bool,
}

/// Control socket server
pub struct IpcServer {
    socket_path: PathBuf,
    context: IpcContext,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, context: IpcContext) -> Self {
        Self {
            socket_path,
            context,
        }
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) -> Result<()> {
        let transport = PlatformListener::bind(&self.socket_path).await?;

        info!("IPC server listening on {:?}", self.socket_path);

        loop {
            match transport.accept().await {
                Ok(stream) => {
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, context).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Serve one connection
///
/// After `Subscribe`, host commands are pushed on the same connection
/// between responses. When the last subscribed host goes away the enforcer
/// is told, so a challenge it was showing is shown again later.
async fn handle_connection<S>(stream: S, context: IpcContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut commands: Option<broadcast::Receiver<HostCommand>> = None;
    let result = serve(stream, &context, &mut commands).await;

    if commands.take().is_some() && !context.bridge.has_hosts() {
        info!("Last host disconnected");
        context.enforcer.host_detached().await?;
    }
    result
}

async fn serve<S>(
    stream: S,
    context: &IpcContext,
    commands: &mut Option<broadcast::Receiver<HostCommand>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let request: IpcRequest = match serde_json::from_str(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        let response = IpcResponse::error(format!("Invalid request: {}", e));
                        send_response(&mut writer, &response).await?;
                        continue;
                    }
                };

                if matches!(request, IpcRequest::Subscribe) {
                    let attached = commands.is_none();
                    if attached {
                        *commands = Some(context.bridge.subscribe());
                    }
                    send_response(&mut writer, &IpcResponse::Subscribed).await?;
                    if context.tamper_monitor {
                        let command = HostCommand::RequestCapability {
                            capability: Capability::Accessibility,
                        };
                        send_response(&mut writer, &IpcResponse::Command { command }).await?;
                    }
                    if attached {
                        context.enforcer.host_attached().await?;
                    }
                    continue;
                }

                let response = handle_request(request, context).await;
                send_response(&mut writer, &response).await?;
            }
            Some(command) = next_command(commands) => {
                send_response(&mut writer, &IpcResponse::Command { command }).await?;
            }
        }
    }

    Ok(())
}

/// Next pushed command; pending forever on unsubscribed connections
async fn next_command(
    commands: &mut Option<broadcast::Receiver<HostCommand>>,
) -> Option<HostCommand> {
    let Some(rx) = commands.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(command) => return Some(command),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Host subscriber lagged, skipped {} commands", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Handle a single request
async fn handle_request(request: IpcRequest, context: &IpcContext) -> IpcResponse {
    // Candidates are secrets; log the request kind only
    debug!("Received IPC request: {}", request_kind(&request));

    let result = dispatch(request, context).await;
    result.unwrap_or_else(|e| IpcResponse::error(e.to_string()))
}

async fn dispatch(request: IpcRequest, context: &IpcContext) -> Result<IpcResponse> {
    let enforcer = &context.enforcer;
    let response = match request {
        IpcRequest::Ping => IpcResponse::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        IpcRequest::Status => IpcResponse::Status {
            status: enforcer.status().await?,
        },

        IpcRequest::LockState { package } => IpcResponse::LockState {
            state: enforcer.lock_state(&package).await?,
            package,
        },

        IpcRequest::SubmitKnowledgeFactor { package, candidate } => {
            let candidate = Zeroizing::new(candidate);
            match enforcer.submit_knowledge_factor(&package, candidate).await? {
                Ok(accepted) => IpcResponse::Verified { accepted },
                Err(e) => IpcResponse::error(e.to_string()),
            }
        }

        IpcRequest::RequestBiometric { package } => {
            match enforcer.request_biometric(&package).await? {
                Ok(session) => IpcResponse::BiometricStarted { session },
                Err(e) => IpcResponse::error(e.to_string()),
            }
        }

        IpcRequest::CancelBiometric => IpcResponse::BiometricCancelled {
            cancelled: enforcer.cancel_biometric().await?,
        },

        IpcRequest::BiometricResult { event } => {
            enforcer.prompt_result(event).await?;
            IpcResponse::Ok
        }

        IpcRequest::BiometricAvailability {
            availability,
            authenticator,
        } => {
            context
                .biometric
                .set_availability(availability, authenticator);
            IpcResponse::Ok
        }

        IpcRequest::PresenterClosed { package } => {
            enforcer.presenter_closed(&package).await?;
            IpcResponse::Ok
        }

        IpcRequest::RetainPresenter => IpcResponse::Retain {
            retain: enforcer.retain_presenter().await?,
        },

        IpcRequest::AccessibilityEvent { event } => {
            context.inputs.accessibility.publish(event);
            IpcResponse::Ok
        }

        IpcRequest::UsageEvent { package, kind } => {
            context.inputs.usage.record(UsageEvent {
                package: PackageName::new(package)?,
                timestamp: context.inputs.clock.now(),
                kind,
            });
            IpcResponse::Ok
        }

        IpcRequest::Tamper { event } => {
            let action = enforcer.tamper(event).await?;
            if let TamperAction::Degraded { to, .. } = action {
                context.policy.set_backend(to);
                persist(context)?;
            }
            IpcResponse::Tamper { action }
        }

        IpcRequest::SetProtected {
            package,
            protected,
            current,
        } => {
            let current = current.map(Zeroizing::new);
            if !protected && !authorize(context, current.as_deref().map(String::as_str)).await? {
                warn!("Refused to unprotect {}: not authorized", package);
                return Ok(IpcResponse::error(CREDENTIAL_REQUIRED));
            }
            let changed = context.policy.set_protected(&package, protected)?;
            if changed {
                persist(context)?;
                enforcer.protected_set_changed().await?;
            }
            IpcResponse::ProtectedChanged { changed }
        }

        IpcRequest::SetDisplayName {
            package,
            name,
            current,
        } => {
            let current = current.map(Zeroizing::new);
            if !authorize(context, current.as_deref().map(String::as_str)).await? {
                warn!("Refused display name change for {}: not authorized", package);
                return Ok(IpcResponse::error(CREDENTIAL_REQUIRED));
            }
            context.policy.set_display_name(&package, &name);
            persist(context)?;
            IpcResponse::Ok
        }

        IpcRequest::SetBiometricEnabled { enabled, current } => {
            let current = current.map(Zeroizing::new);
            if !authorize(context, current.as_deref().map(String::as_str)).await? {
                warn!("Refused biometric toggle: not authorized");
                return Ok(IpcResponse::error(CREDENTIAL_REQUIRED));
            }
            context.policy.set_biometric_enabled(enabled);
            persist(context)?;
            IpcResponse::Ok
        }

        IpcRequest::SetCredential {
            lock_type,
            credential,
            current,
        } => {
            let credential = Zeroizing::new(credential);
            let current = current.map(Zeroizing::new);

            if context.credentials.is_set()
                && !verify_current(context, current.as_deref().map(String::as_str))?
            {
                warn!("Credential change rejected: current credential not verified");
                return Ok(IpcResponse::error(CREDENTIAL_REQUIRED));
            }

            let factor = KnowledgeFactor::parse(lock_type, &credential)?;
            context.credentials.set(&factor)?;
            context.policy.set_lock_type(lock_type);
            persist(context)?;
            enforcer.lock_type_reset().await?;
            IpcResponse::Ok
        }

        IpcRequest::ResetCredential { current } => {
            let current = Zeroizing::new(current);
            if !verify_current(context, Some(current.as_str()))? {
                warn!("Credential reset rejected: current credential not verified");
                return Ok(IpcResponse::error(CREDENTIAL_REQUIRED));
            }
            context.credentials.reset()?;
            enforcer.lock_type_reset().await?;
            IpcResponse::Ok
        }

        IpcRequest::Subscribe => IpcResponse::Subscribed,
    };
    Ok(response)
}

fn request_kind(request: &IpcRequest) -> &'static str {
    match request {
        IpcRequest::Ping => "Ping",
        IpcRequest::Status => "Status",
        IpcRequest::LockState { .. } => "LockState",
        IpcRequest::SubmitKnowledgeFactor { .. } => "SubmitKnowledgeFactor",
        IpcRequest::RequestBiometric { .. } => "RequestBiometric",
        IpcRequest::CancelBiometric => "CancelBiometric",
        IpcRequest::BiometricResult { .. } => "BiometricResult",
        IpcRequest::BiometricAvailability { .. } => "BiometricAvailability",
        IpcRequest::PresenterClosed { .. } => "PresenterClosed",
        IpcRequest::RetainPresenter => "RetainPresenter",
        IpcRequest::AccessibilityEvent { .. } => "AccessibilityEvent",
        IpcRequest::UsageEvent { .. } => "UsageEvent",
        IpcRequest::Tamper { .. } => "Tamper",
        IpcRequest::SetProtected { .. } => "SetProtected",
        IpcRequest::SetDisplayName { .. } => "SetDisplayName",
        IpcRequest::SetBiometricEnabled { .. } => "SetBiometricEnabled",
        IpcRequest::SetCredential { .. } => "SetCredential",
        IpcRequest::ResetCredential { .. } => "ResetCredential",
        IpcRequest::Subscribe => "Subscribe",
    }
}

const CREDENTIAL_REQUIRED: &str = "Current credential required";

/// Check `current` against the stored credential
fn verify_current(context: &IpcContext, current: Option<&str>) -> Result<bool> {
    let (Some(current), Some(stored)) = (current, context.credentials.lock_type()) else {
        return Ok(false);
    };
    match KnowledgeFactor::parse(stored, current) {
        Ok(factor) => context.credentials.validate(&factor),
        Err(_) => Ok(false),
    }
}

/// Whether a change that weakens protection may proceed
///
/// Allowed with no credential set, with the current credential, or under
/// anti-uninstall while the controlling package holds its unlocked session.
async fn authorize(context: &IpcContext, current: Option<&str>) -> Result<bool> {
    if !context.credentials.is_set() || verify_current(context, current)? {
        return Ok(true);
    }
    if !context.policy.anti_uninstall_enabled() {
        return Ok(false);
    }
    let controlling = context.policy.snapshot().controlling_package;
    let status = context.enforcer.status().await?;
    Ok(status
        .foreground_session
        .is_some_and(|session| session.as_str() == controlling))
}

/// Write the current configuration back to disk
fn persist(context: &IpcContext) -> Result<()> {
    if let Some(path) = &context.config_path {
        context.policy.snapshot().save(path)?;
    }
    Ok(())
}

/// Send a response over the socket
async fn send_response<W>(writer: &mut W, response: &IpcResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnforcementConfig;
    use crate::foreground::MonotonicClock;
    use crate::runtime::assemble;
    use tempfile::{tempdir, TempDir};
    use tokio::io::DuplexStream;

    type Lines = tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>;
    type Writer = tokio::io::WriteHalf<DuplexStream>;

    fn connect(anti_uninstall: bool) -> (Lines, Writer, IpcContext, TempDir) {
        let dir = tempdir().unwrap();
        let config = EnforcementConfig {
            anti_uninstall_enabled: anti_uninstall,
            credential_path: dir.path().join("credential.json"),
            privileged_socket_path: dir.path().join("privileged.sock"),
            ..Default::default()
        };
        let components = assemble(config, None, Arc::new(MonotonicClock::new())).unwrap();
        crate::enforcer::spawn(components.enforcer);
        let context = components.context;

        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_connection(server, context.clone()));
        let (reader, writer) = tokio::io::split(client);
        (BufReader::new(reader).lines(), writer, context, dir)
    }

    async fn send(writer: &mut Writer, line: &str) {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(lines: &mut Lines) -> IpcResponse {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn assert_refused(response: IpcResponse) {
        match response {
            IpcResponse::Error { message } => assert_eq!(message, CREDENTIAL_REQUIRED),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    async fn set_pin(lines: &mut Lines, writer: &mut Writer) {
        send(
            writer,
            r#"{"type": "SetCredential", "lock_type": "pin", "credential": "482913"}"#,
        )
        .await;
        assert!(matches!(recv(lines).await, IpcResponse::Ok));
    }

    #[tokio::test]
    async fn test_invalid_request_keeps_connection() {
        let (mut lines, mut writer, _context, _dir) = connect(false);

        send(&mut writer, "{not json").await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Error { .. }));

        send(&mut writer, r#"{"type": "Ping"}"#).await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Pong { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_requests_tamper_monitor() {
        let (mut lines, mut writer, context, _dir) = connect(true);

        send(&mut writer, r#"{"type": "Subscribe"}"#).await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Subscribed));
        assert!(matches!(
            recv(&mut lines).await,
            IpcResponse::Command {
                command: HostCommand::RequestCapability {
                    capability: Capability::Accessibility
                }
            }
        ));

        // Commands from the bridge are pushed on the same connection
        context.bridge.send(HostCommand::CancelBiometricPrompt {
            session: applock_core::SessionId(7),
        });
        assert!(matches!(
            recv(&mut lines).await,
            IpcResponse::Command {
                command: HostCommand::CancelBiometricPrompt { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_usage_events_are_stamped_and_recorded() {
        let (mut lines, mut writer, context, _dir) = connect(false);

        send(
            &mut writer,
            r#"{"type": "UsageEvent", "package": "com.example.bank", "kind": "moved_to_foreground"}"#,
        )
        .await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Ok));
        assert_eq!(context.inputs.usage.len(), 1);

        send(
            &mut writer,
            r#"{"type": "UsageEvent", "package": "", "kind": "moved_to_foreground"}"#,
        )
        .await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Error { .. }));
        assert_eq!(context.inputs.usage.len(), 1);
    }

    #[tokio::test]
    async fn test_biometric_request_without_challenge() {
        let (mut lines, mut writer, _context, _dir) = connect(false);

        send(
            &mut writer,
            r#"{"type": "RequestBiometric", "package": "com.example.bank"}"#,
        )
        .await;
        match recv(&mut lines).await {
            IpcResponse::Error { message } => assert!(message.contains("No pending challenge")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_weakening_changes_need_credential() {
        let (mut lines, mut writer, context, _dir) = connect(false);
        set_pin(&mut lines, &mut writer).await;

        // Adding protection is always allowed
        send(
            &mut writer,
            r#"{"type": "SetProtected", "package": "com.example.bank", "protected": true}"#,
        )
        .await;
        assert!(matches!(
            recv(&mut lines).await,
            IpcResponse::ProtectedChanged { changed: true }
        ));

        send(
            &mut writer,
            r#"{"type": "SetProtected", "package": "com.example.bank", "protected": false}"#,
        )
        .await;
        assert_refused(recv(&mut lines).await);
        send(
            &mut writer,
            r#"{"type": "SetProtected", "package": "com.example.bank", "protected": false, "current": "000000"}"#,
        )
        .await;
        assert_refused(recv(&mut lines).await);
        assert!(context.policy.is_protected("com.example.bank"));

        send(&mut writer, r#"{"type": "SetBiometricEnabled", "enabled": true}"#).await;
        assert_refused(recv(&mut lines).await);
        send(
            &mut writer,
            r#"{"type": "SetDisplayName", "package": "com.example.bank", "name": "Bank"}"#,
        )
        .await;
        assert_refused(recv(&mut lines).await);
        assert!(!context.policy.biometric_enabled());

        send(
            &mut writer,
            r#"{"type": "SetProtected", "package": "com.example.bank", "protected": false, "current": "482913"}"#,
        )
        .await;
        assert!(matches!(
            recv(&mut lines).await,
            IpcResponse::ProtectedChanged { changed: true }
        ));
        send(
            &mut writer,
            r#"{"type": "SetBiometricEnabled", "enabled": true, "current": "482913"}"#,
        )
        .await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Ok));
        assert!(context.policy.biometric_enabled());
    }

    #[tokio::test]
    async fn test_reset_credential() {
        let (mut lines, mut writer, context, _dir) = connect(false);
        set_pin(&mut lines, &mut writer).await;

        send(&mut writer, r#"{"type": "ResetCredential", "current": "111111"}"#).await;
        assert_refused(recv(&mut lines).await);
        assert!(context.credentials.is_set());

        send(&mut writer, r#"{"type": "ResetCredential", "current": "482913"}"#).await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Ok));
        assert!(!context.credentials.is_set());

        // Nothing left to check against
        send(&mut writer, r#"{"type": "SetBiometricEnabled", "enabled": true}"#).await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Ok));
    }

    #[tokio::test]
    async fn test_controlling_session_authorizes_changes() {
        let (mut lines, mut writer, context, _dir) = connect(true);
        set_pin(&mut lines, &mut writer).await;

        send(&mut writer, r#"{"type": "SetBiometricEnabled", "enabled": true}"#).await;
        assert_refused(recv(&mut lines).await);

        tokio::task::yield_now().await;
        while context.enforcer.status().await.unwrap().pending.is_empty() {
            context
                .inputs
                .accessibility
                .publish(crate::foreground::AccessibilityEvent {
                    kind: crate::foreground::WindowEventKind::WindowStateChanged,
                    package: "dev.applock".into(),
                    class_name: None,
                });
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        send(
            &mut writer,
            r#"{"type": "SubmitKnowledgeFactor", "package": "dev.applock", "candidate": "482913"}"#,
        )
        .await;
        assert!(matches!(
            recv(&mut lines).await,
            IpcResponse::Verified { accepted: true }
        ));

        send(&mut writer, r#"{"type": "SetBiometricEnabled", "enabled": true}"#).await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Ok));
    }

    #[tokio::test]
    async fn test_host_disconnect_hides_challenge() {
        let (mut lines, mut writer, context, _dir) = connect(false);
        context.policy.set_protected("com.example.bank", true).unwrap();

        send(&mut writer, r#"{"type": "Subscribe"}"#).await;
        assert!(matches!(recv(&mut lines).await, IpcResponse::Subscribed));

        tokio::task::yield_now().await;
        while context.enforcer.status().await.unwrap().pending.is_empty() {
            context
                .inputs
                .accessibility
                .publish(crate::foreground::AccessibilityEvent {
                    kind: crate::foreground::WindowEventKind::WindowStateChanged,
                    package: "com.example.bank".into(),
                    class_name: None,
                });
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(matches!(
            recv(&mut lines).await,
            IpcResponse::Command {
                command: HostCommand::ShowChallenge(_)
            }
        ));
        assert!(context.enforcer.status().await.unwrap().presenter_visible);

        drop(lines);
        drop(writer);
        while context.bridge.has_hosts() || context.enforcer.status().await.unwrap().presenter_visible {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            context.enforcer.lock_state("com.example.bank").await.unwrap(),
            applock_core::LockState::ChallengePending
        );
    }
}
