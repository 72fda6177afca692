//! AppLock Core - Shared types for per-application access control
//!
//! This crate provides the foundational types used by the enforcement engine
//! and by anything that talks to it:
//! - Package names and monotonic timestamps
//! - Per-package lock states and temporary-unlock grants
//! - Authentication sessions, states, and the biometric error taxonomy
//! - Knowledge-factor (PIN / pattern) formats

pub mod auth;
pub mod credential;
pub mod error;
pub mod lock;
pub mod types;

pub use auth::{
    AuthSession, AuthState, AuthenticatorClass, Availability, BiometricError,
    BiometricErrorKind, SessionId,
};
pub use credential::{KnowledgeFactor, LockType, Pattern, Pin};
pub use error::{Error, Result};
pub use lock::{AuthFactor, LockState, UnlockGrant};
pub use types::{PackageName, Timestamp};

/// Number of digits in a PIN
pub const PIN_LENGTH: usize = 6;

/// Minimum number of points in an unlock pattern
pub const MIN_PATTERN_POINTS: usize = 4;

/// Side length of the pattern grid (3x3)
pub const PATTERN_GRID_SIZE: u8 = 3;

/// Default grace interval after a successful unlock, in seconds
pub const DEFAULT_GRACE_SECS: u64 = 0;
