//! Error types for the AppLock core library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("PIN must be exactly {0} digits")]
    InvalidPinLength(usize),

    #[error("PIN must contain only digits")]
    InvalidPinFormat,

    #[error("Pattern must have at least {0} points")]
    PatternTooShort(usize),

    #[error("Pattern point out of range: {0}")]
    PatternPointOutOfRange(String),

    #[error("Pattern visits point {0} more than once")]
    PatternRepeatedPoint(u8),

    #[error("Credential does not match lock type {0}")]
    LockTypeMismatch(String),
}
