//! Accessibility-service backend
//!
//! The host forwards raw window events. Only window-state changes mean a new
//! activity took the foreground; content changes and focus noise are dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use applock_core::PackageName;

use super::{Clock, ForegroundEvent, ForegroundSource};
use crate::config::Backend;
use crate::error::Result;

/// Kind of raw window event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowEventKind {
    WindowStateChanged,
    WindowContentChanged,
    WindowsChanged,
    ViewFocused,
}

/// Raw event from the accessibility service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityEvent {
    pub kind: WindowEventKind,
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// Fan-out of raw accessibility events to the active source
#[derive(Debug, Clone)]
pub struct AccessibilityFeed {
    tx: broadcast::Sender<AccessibilityEvent>,
}

impl AccessibilityFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccessibilityEvent> {
        self.tx.subscribe()
    }

    /// Forward an event; dropped if no accessibility source is running
    pub fn publish(&self, event: AccessibilityEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for AccessibilityFeed {
    fn default() -> Self {
        Self::new(128)
    }
}

pub struct AccessibilitySource {
    events: broadcast::Receiver<AccessibilityEvent>,
    clock: Arc<dyn Clock>,
    ignored: Arc<BTreeSet<String>>,
    last: Option<PackageName>,
}

impl AccessibilitySource {
    pub fn new(
        events: broadcast::Receiver<AccessibilityEvent>,
        clock: Arc<dyn Clock>,
        ignored: Arc<BTreeSet<String>>,
    ) -> Self {
        Self {
            events,
            clock,
            ignored,
            last: None,
        }
    }

    /// Filter a raw event down to a foreground change
    fn accept(&mut self, event: &AccessibilityEvent) -> Option<PackageName> {
        if event.kind != WindowEventKind::WindowStateChanged {
            return None;
        }
        if self.ignored.contains(&event.package) {
            return None;
        }
        let package = match PackageName::new(event.package.as_str()) {
            Ok(package) => package,
            Err(e) => {
                debug!("Skipping window event: {}", e);
                return None;
            }
        };
        if self.last.as_ref() == Some(&package) {
            return None;
        }
        self.last = Some(package.clone());
        Some(package)
    }
}

#[async_trait]
impl ForegroundSource for AccessibilitySource {
    fn backend(&self) -> Backend {
        Backend::Accessibility
    }

    async fn run(self: Box<Self>, sink: mpsc::Sender<ForegroundEvent>) -> Result<()> {
        let mut this = self;
        info!("Accessibility foreground source started");
        loop {
            let event = match this.events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Accessibility source lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };

            if let Some(package) = this.accept(&event) {
                let event = ForegroundEvent {
                    package,
                    timestamp: this.clock.now(),
                    backend: Backend::Accessibility,
                };
                if sink.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
