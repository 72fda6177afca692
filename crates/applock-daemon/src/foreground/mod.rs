//! Foreground activity detection
//!
//! Three interchangeable backends report the package that just came to the
//! foreground. Whichever is configured, the engine only ever sees a
//! [`ForegroundEvent`].

mod accessibility;
mod polling;
mod privileged;

pub use accessibility::{AccessibilityEvent, AccessibilityFeed, AccessibilitySource, WindowEventKind};
pub use polling::{UsageEvent, UsageEventKind, UsageEventLog, UsagePollingSource, UsageStatsProvider};
pub use privileged::{ForegroundReport, PrivilegedIpcSource};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use applock_core::{PackageName, Timestamp};

use crate::config::{Backend, EnforcementConfig};
use crate::error::Result;

/// A package came to the foreground
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundEvent {
    pub package: PackageName,
    pub timestamp: Timestamp,
    pub backend: Backend,
}

/// Source of monotonic timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Milliseconds since the clock was created
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let millis = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        Timestamp::from_millis(millis)
    }
}

/// A foreground detection backend
#[async_trait]
pub trait ForegroundSource: Send {
    fn backend(&self) -> Backend;

    /// Emit events into `sink` until the sink closes or the source fails
    async fn run(self: Box<Self>, sink: mpsc::Sender<ForegroundEvent>) -> Result<()>;
}

/// Inputs shared by all backends
#[derive(Clone)]
pub struct SourceInputs {
    pub clock: Arc<dyn Clock>,
    pub accessibility: AccessibilityFeed,
    pub usage: Arc<UsageEventLog>,
    pub ignored: Arc<BTreeSet<String>>,
}

impl SourceInputs {
    pub fn new(clock: Arc<dyn Clock>, config: &EnforcementConfig) -> Self {
        Self {
            clock,
            accessibility: AccessibilityFeed::default(),
            usage: Arc::new(UsageEventLog::default()),
            ignored: Arc::new(config.ignored_packages.clone()),
        }
    }
}

/// Construct the source for a backend
pub fn build_source(
    backend: Backend,
    config: &EnforcementConfig,
    inputs: &SourceInputs,
) -> Box<dyn ForegroundSource> {
    match backend {
        Backend::Accessibility => Box::new(AccessibilitySource::new(
            inputs.accessibility.subscribe(),
            inputs.clock.clone(),
            inputs.ignored.clone(),
        )),
        Backend::UsageStats => Box::new(UsagePollingSource::new(
            inputs.usage.clone(),
            config.poll_interval(),
            inputs.ignored.clone(),
        )),
        Backend::PrivilegedIpc => Box::new(PrivilegedIpcSource::new(
            config.privileged_socket_path.clone(),
            inputs.clock.clone(),
            inputs.ignored.clone(),
        )),
    }
}
