//! Daemon configuration and the policy view the engine reads

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use applock_core::{LockType, PackageName, DEFAULT_GRACE_SECS};

use crate::error::{DaemonError, Result};

/// Longest grace interval accepted from configuration
const MAX_GRACE_SECS: u64 = 24 * 60 * 60;

/// Foreground detection backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Window-state events from an accessibility service
    #[default]
    Accessibility,
    /// Periodic queries of recent usage events
    UsageStats,
    /// Reports pushed by a privileged helper over a local socket
    PrivilegedIpc,
}

impl Backend {
    /// Backends to try, in order, when this one loses its capability
    pub fn fallbacks(&self) -> &'static [Backend] {
        match self {
            Backend::PrivilegedIpc => &[Backend::Accessibility, Backend::UsageStats],
            Backend::Accessibility => &[Backend::UsageStats, Backend::PrivilegedIpc],
            Backend::UsageStats => &[Backend::Accessibility, Backend::PrivilegedIpc],
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Accessibility => f.write_str("accessibility"),
            Backend::UsageStats => f.write_str("usage_stats"),
            Backend::PrivilegedIpc => f.write_str("privileged_ipc"),
        }
    }
}

/// What the anti-tamper guard does when a capability is being removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TamperResponse {
    /// Ask the host to grant the capability again
    #[default]
    Reassert,
    /// Switch to a backend that does not depend on it
    Fallback,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Packages under enforcement
    pub protected_packages: BTreeSet<String>,

    /// Display names supplied by the host, keyed by package
    pub display_names: BTreeMap<String, String>,

    /// Whether the biometric factor may be offered
    pub biometric_enabled: bool,

    /// Seconds a successful unlock stays valid (0 = no residual grace)
    pub grace_interval_secs: u64,

    /// Protect the controlling application and the enforcement capability
    pub anti_uninstall_enabled: bool,

    /// Knowledge-factor type
    pub lock_type: LockType,

    /// Foreground detection backend
    pub backend: Backend,

    /// Reaction to capability removal
    pub tamper_response: TamperResponse,

    /// Package of the enforcement application itself
    pub controlling_package: String,

    /// Identity the challenge surface reports when it is in the foreground
    pub presenter_package: String,

    /// Packages never reported as foreground changes (system UI, keyboards)
    pub ignored_packages: BTreeSet<String>,

    /// Unix socket path for the control protocol
    pub control_socket_path: PathBuf,

    /// Unix socket path for privileged foreground reports
    pub privileged_socket_path: PathBuf,

    /// Path of the credential hash file
    pub credential_path: PathBuf,

    /// Usage-stats polling interval (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            protected_packages: BTreeSet::new(),
            display_names: BTreeMap::new(),
            biometric_enabled: false,
            grace_interval_secs: DEFAULT_GRACE_SECS,
            anti_uninstall_enabled: false,
            lock_type: LockType::Pin,
            backend: Backend::Accessibility,
            tamper_response: TamperResponse::Reassert,
            controlling_package: "dev.applock".to_string(),
            presenter_package: "dev.applock.challenge".to_string(),
            ignored_packages: Self::default_ignored_packages(),
            control_socket_path: Self::default_runtime_path("applock.sock"),
            privileged_socket_path: Self::default_runtime_path("applock-privileged.sock"),
            credential_path: Self::default_credential_path(),
            poll_interval_ms: 500,
        }
    }
}

impl EnforcementConfig {
    fn default_ignored_packages() -> BTreeSet<String> {
        [
            "com.android.systemui",
            "com.google.android.inputmethod.latin",
            "com.samsung.android.honeyboard",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    /// Socket paths live in XDG_RUNTIME_DIR when available, /tmp otherwise
    fn default_runtime_path(name: &str) -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(name)
    }

    fn default_credential_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("applock")
            .join("credential.json")
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("applock")
            .join("daemon.json")
    }

    pub fn grace_interval(&self) -> Duration {
        Duration::from_secs(self.grace_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the engine cannot enforce safely
    pub fn validate(&self) -> Result<()> {
        PackageName::new(self.controlling_package.as_str())?;
        PackageName::new(self.presenter_package.as_str())?;
        for package in &self.protected_packages {
            PackageName::new(package.as_str())?;
        }

        if self.controlling_package == self.presenter_package {
            return Err(DaemonError::Config(
                "presenter_package must differ from controlling_package".to_string(),
            ));
        }
        if self.protected_packages.contains(&self.presenter_package) {
            return Err(DaemonError::Config(format!(
                "presenter package {} cannot be protected",
                self.presenter_package
            )));
        }
        if let Some(package) = self
            .protected_packages
            .iter()
            .find(|p| self.ignored_packages.contains(*p))
        {
            return Err(DaemonError::Config(format!(
                "package {} is both protected and ignored",
                package
            )));
        }
        if self.grace_interval_secs > MAX_GRACE_SECS {
            return Err(DaemonError::Config(format!(
                "grace_interval_secs must be at most {}",
                MAX_GRACE_SECS
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(DaemonError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> Result<()> {
        for path in [
            &self.control_socket_path,
            &self.privileged_socket_path,
            &self.credential_path,
        ] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Work to start at boot
    pub fn boot_plan(&self) -> BootPlan {
        BootPlan {
            backend: self.backend,
            // Capability removal is only observable through the accessibility
            // service, so it runs whenever anti-uninstall is on.
            tamper_monitor: self.anti_uninstall_enabled,
        }
    }
}

/// Services to start when the daemon comes up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPlan {
    /// Foreground backend feeding the engine
    pub backend: Backend,
    /// Whether the accessibility-based tamper monitor must run
    pub tamper_monitor: bool,
}

/// Read-only configuration view consulted by the engine
pub trait LockPolicy: Send + Sync {
    /// Whether the package is under enforcement
    fn is_protected(&self, package: &str) -> bool;

    /// Whether the biometric factor is enabled
    fn biometric_enabled(&self) -> bool;

    /// Validity of a grant after successful authentication
    fn grace_interval(&self) -> Duration;

    /// Whether the controlling application is guarded
    fn anti_uninstall_enabled(&self) -> bool;

    /// Configured knowledge-factor type
    fn lock_type(&self) -> LockType;

    /// Name shown on the challenge surface
    fn display_name(&self, package: &str) -> String {
        package.to_string()
    }
}

impl LockPolicy for EnforcementConfig {
    fn is_protected(&self, package: &str) -> bool {
        self.protected_packages.contains(package)
    }

    fn biometric_enabled(&self) -> bool {
        self.biometric_enabled
    }

    fn grace_interval(&self) -> Duration {
        EnforcementConfig::grace_interval(self)
    }

    fn anti_uninstall_enabled(&self) -> bool {
        self.anti_uninstall_enabled
    }

    fn lock_type(&self) -> LockType {
        self.lock_type
    }

    fn display_name(&self, package: &str) -> String {
        self.display_names
            .get(package)
            .cloned()
            .unwrap_or_else(|| package.to_string())
    }
}

/// Configuration shared between the engine and the control socket
///
/// Readers see a consistent snapshot; writers go through the update methods so
/// the enforcer can react to protected-set changes.
#[derive(Debug)]
pub struct SharedPolicy {
    inner: RwLock<EnforcementConfig>,
}

impl SharedPolicy {
    pub fn new(config: EnforcementConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&EnforcementConfig) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut EnforcementConfig) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> EnforcementConfig {
        self.read(|c| c.clone())
    }

    /// Add or remove a package from the protected set
    ///
    /// Returns true if membership changed.
    pub fn set_protected(&self, package: &str, protected: bool) -> Result<bool> {
        PackageName::new(package)?;
        Ok(self.write(|config| {
            if protected {
                if config.presenter_package == package || config.ignored_packages.contains(package)
                {
                    return false;
                }
                config.protected_packages.insert(package.to_string())
            } else {
                config.protected_packages.remove(package)
            }
        }))
    }

    pub fn set_display_name(&self, package: &str, name: &str) {
        self.write(|config| {
            config
                .display_names
                .insert(package.to_string(), name.to_string());
        });
    }

    pub fn set_biometric_enabled(&self, enabled: bool) {
        self.write(|config| config.biometric_enabled = enabled);
    }

    pub fn set_lock_type(&self, lock_type: LockType) {
        self.write(|config| config.lock_type = lock_type);
    }

    pub fn set_backend(&self, backend: Backend) {
        self.write(|config| config.backend = backend);
    }
}

impl LockPolicy for SharedPolicy {
    fn is_protected(&self, package: &str) -> bool {
        self.read(|c| c.is_protected(package))
    }

    fn biometric_enabled(&self) -> bool {
        self.read(|c| c.biometric_enabled)
    }

    fn grace_interval(&self) -> Duration {
        self.read(|c| c.grace_interval())
    }

    fn anti_uninstall_enabled(&self) -> bool {
        self.read(|c| c.anti_uninstall_enabled)
    }

    fn lock_type(&self) -> LockType {
        self.read(|c| c.lock_type)
    }

    fn display_name(&self, package: &str) -> String {
        self.read(|c| LockPolicy::display_name(c, package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EnforcementConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EnforcementConfig =
            serde_json::from_str(r#"{"protected_packages": ["com.example.bank"]}"#).unwrap();
        assert!(config.is_protected("com.example.bank"));
        assert_eq!(config.backend, Backend::Accessibility);
        assert_eq!(config.grace_interval(), Duration::ZERO);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.json");

        let mut config = EnforcementConfig::default();
        config.protected_packages.insert("com.example.bank".into());
        config.grace_interval_secs = 30;
        config.backend = Backend::UsageStats;
        config.save(&path).unwrap();

        let loaded = EnforcementConfig::load(&path).unwrap();
        assert!(loaded.is_protected("com.example.bank"));
        assert_eq!(loaded.grace_interval(), Duration::from_secs(30));
        assert_eq!(loaded.backend, Backend::UsageStats);
    }

    #[test]
    fn test_rejects_protected_presenter() {
        let mut config = EnforcementConfig::default();
        config
            .protected_packages
            .insert(config.presenter_package.clone());
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_rejects_same_controlling_and_presenter() {
        let config = EnforcementConfig {
            presenter_package: "dev.applock".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_excessive_grace() {
        let config = EnforcementConfig {
            grace_interval_secs: MAX_GRACE_SECS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_boot_plan_starts_tamper_monitor_with_anti_uninstall() {
        let config = EnforcementConfig {
            anti_uninstall_enabled: true,
            backend: Backend::PrivilegedIpc,
            ..Default::default()
        };
        let plan = config.boot_plan();
        assert_eq!(plan.backend, Backend::PrivilegedIpc);
        assert!(plan.tamper_monitor);
        assert!(!EnforcementConfig::default().boot_plan().tamper_monitor);
    }

    #[test]
    fn test_shared_policy_updates() {
        let policy = SharedPolicy::new(EnforcementConfig::default());
        assert!(!policy.is_protected("com.example.bank"));

        assert!(policy.set_protected("com.example.bank", true).unwrap());
        assert!(!policy.set_protected("com.example.bank", true).unwrap());
        assert!(policy.is_protected("com.example.bank"));

        // The challenge surface can never be protected
        assert!(!policy.set_protected("dev.applock.challenge", true).unwrap());

        assert!(policy.set_protected("com.example.bank", false).unwrap());
        assert!(!policy.is_protected("com.example.bank"));
        assert!(policy.set_protected("bad name", true).is_err());
    }

    #[test]
    fn test_display_name_falls_back_to_package() {
        let policy = SharedPolicy::new(EnforcementConfig::default());
        assert_eq!(policy.display_name("com.example.bank"), "com.example.bank");
        policy.set_display_name("com.example.bank", "Bank");
        assert_eq!(policy.display_name("com.example.bank"), "Bank");
    }
}
