//! Per-package lock states and temporary-unlock grants

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{PackageName, Timestamp};

/// Factor that satisfied (or is being used for) a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFactor {
    /// PIN or pattern validated against the stored credential
    Knowledge,
    /// Platform biometric prompt (may fall back to the device credential)
    Biometric,
}

impl fmt::Display for AuthFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFactor::Knowledge => f.write_str("knowledge"),
            AuthFactor::Biometric => f.write_str("biometric"),
        }
    }
}

/// Lock state of a single protected package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    /// Access requires a challenge
    #[default]
    Locked,

    /// A challenge has been raised and not yet satisfied
    ChallengePending,

    /// Unlocked until the grant expires
    TemporarilyUnlocked {
        /// Monotonic timestamp at which the grant stops being valid
        grant_expiry: Timestamp,
    },
}

impl LockState {
    /// Resolve the state as observed at `now`
    ///
    /// An unlocked state whose grant has expired reads as `Locked` even if
    /// nobody has materialized the transition yet.
    pub fn at(self, now: Timestamp) -> LockState {
        match self {
            LockState::TemporarilyUnlocked { grant_expiry } if now >= grant_expiry => {
                LockState::Locked
            }
            other => other,
        }
    }

    /// Check if the package is accessible at `now`
    pub fn is_unlocked_at(&self, now: Timestamp) -> bool {
        matches!(self.at(now), LockState::TemporarilyUnlocked { .. })
    }
}

/// A temporary unlock issued after successful authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockGrant {
    /// Package the grant applies to
    pub package: PackageName,

    /// Grant is valid while `now < expiry`
    pub expiry: Timestamp,

    /// Factor that produced the grant
    pub origin: AuthFactor,
}

impl UnlockGrant {
    pub fn new(package: PackageName, expiry: Timestamp, origin: AuthFactor) -> Self {
        Self {
            package,
            expiry,
            origin,
        }
    }

    /// Check if the grant has expired at the given timestamp
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }

    /// Remaining validity (zero once expired)
    pub fn remaining(&self, now: Timestamp) -> std::time::Duration {
        self.expiry.saturating_duration_since(now)
    }
}
