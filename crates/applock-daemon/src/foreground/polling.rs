//! Usage-stats polling backend
//!
//! Periodically asks a [`UsageStatsProvider`] for usage events recorded after
//! the last one consumed and reports the most recent foreground move.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use applock_core::{PackageName, Timestamp};

use super::{ForegroundEvent, ForegroundSource};
use crate::config::Backend;
use crate::error::Result;

/// Maximum usage events retained by [`UsageEventLog`]
const USAGE_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventKind {
    MovedToForeground,
    MovedToBackground,
}

/// One usage-stats record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub package: PackageName,
    pub timestamp: Timestamp,
    pub kind: UsageEventKind,
}

/// Queryable record of recent usage events
///
/// Every recorded event carries a sequence number that strictly increases,
/// so events stamped in the same millisecond are still told apart.
pub trait UsageStatsProvider: Send + Sync {
    /// Events with a sequence number greater than `cursor`, oldest first
    fn events_after(&self, cursor: u64) -> Vec<(u64, UsageEvent)>;
}

#[derive(Debug, Default)]
struct LogState {
    events: VecDeque<(u64, UsageEvent)>,
    last_seq: u64,
}

/// Bounded in-memory usage log fed by the host
#[derive(Debug, Default)]
pub struct UsageEventLog {
    state: Mutex<LogState>,
}

impl UsageEventLog {
    /// Append an event; returns its sequence number
    pub fn record(&self, event: UsageEvent) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.events.len() == USAGE_LOG_CAPACITY {
            state.events.pop_front();
        }
        state.last_seq += 1;
        let seq = state.last_seq;
        state.events.push_back((seq, event));
        seq
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageStatsProvider for UsageEventLog {
    fn events_after(&self, cursor: u64) -> Vec<(u64, UsageEvent)> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .events
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .cloned()
            .collect()
    }
}

pub struct UsagePollingSource {
    provider: Arc<dyn UsageStatsProvider>,
    poll_interval: Duration,
    ignored: Arc<BTreeSet<String>>,
    /// Sequence number of the newest event already consumed
    cursor: u64,
    last: Option<PackageName>,
}

impl UsagePollingSource {
    pub fn new(
        provider: Arc<dyn UsageStatsProvider>,
        poll_interval: Duration,
        ignored: Arc<BTreeSet<String>>,
    ) -> Self {
        Self {
            provider,
            poll_interval,
            ignored,
            cursor: 0,
            last: None,
        }
    }

    /// Query once; returns the new foreground package if it changed
    fn poll(&mut self) -> Option<(PackageName, Timestamp)> {
        let events = self.provider.events_after(self.cursor);
        if let Some((seq, _)) = events.last() {
            self.cursor = *seq;
        }

        let (package, timestamp) = events
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.kind == UsageEventKind::MovedToForeground)
            .filter(|e| !self.ignored.contains(e.package.as_str()))
            .map(|e| (e.package, e.timestamp))
            .last()?;

        if self.last.as_ref() == Some(&package) {
            return None;
        }
        self.last = Some(package.clone());
        Some((package, timestamp))
    }
}

#[async_trait]
impl ForegroundSource for UsagePollingSource {
    fn backend(&self) -> Backend {
        Backend::UsageStats
    }

    async fn run(self: Box<Self>, sink: mpsc::Sender<ForegroundEvent>) -> Result<()> {
        let mut this = self;
        info!(
            "Usage-stats foreground source polling every {:?}",
            this.poll_interval
        );

        let mut ticker = interval(this.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if sink.is_closed() {
                return Ok(());
            }
            if let Some((package, timestamp)) = this.poll() {
                debug!("Usage stats report {} in foreground", package);
                let event = ForegroundEvent {
                    package,
                    timestamp,
                    backend: Backend::UsageStats,
                };
                if sink.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
