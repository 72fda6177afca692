//! Knowledge-factor formats
//!
//! A PIN is exactly [`PIN_LENGTH`] digits. A pattern is a path over a 3x3 grid
//! whose cells are numbered 0-8 row by row, serialized as comma-separated
//! indices (`"0,1,2,5"`), with at least [`MIN_PATTERN_POINTS`] distinct cells.
//!
//! Candidates are held in zeroizing buffers and never printed.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::{MIN_PATTERN_POINTS, PATTERN_GRID_SIZE, PIN_LENGTH};

/// Configured knowledge-factor type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    #[default]
    Pin,
    Pattern,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Pin => f.write_str("pin"),
            LockType::Pattern => f.write_str("pattern"),
        }
    }
}

/// A validated PIN
pub struct Pin(Zeroizing<String>);

impl Pin {
    pub fn parse(candidate: &str) -> Result<Self> {
        if candidate.len() != PIN_LENGTH {
            return Err(Error::InvalidPinLength(PIN_LENGTH));
        }
        if !candidate.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidPinFormat);
        }
        Ok(Self(Zeroizing::new(candidate.to_string())))
    }
}

/// A validated unlock pattern
pub struct Pattern(Zeroizing<Vec<u8>>);

impl Pattern {
    pub fn parse(candidate: &str) -> Result<Self> {
        let max_index = PATTERN_GRID_SIZE * PATTERN_GRID_SIZE;
        let mut seen = [false; (PATTERN_GRID_SIZE * PATTERN_GRID_SIZE) as usize];
        let mut points = Zeroizing::new(Vec::with_capacity(max_index as usize));

        for raw in candidate.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let point: u8 = raw
                .parse()
                .map_err(|_| Error::PatternPointOutOfRange(raw.to_string()))?;
            if point >= max_index {
                return Err(Error::PatternPointOutOfRange(raw.to_string()));
            }
            if seen[point as usize] {
                return Err(Error::PatternRepeatedPoint(point));
            }
            seen[point as usize] = true;
            points.push(point);
        }

        if points.len() < MIN_PATTERN_POINTS {
            return Err(Error::PatternTooShort(MIN_PATTERN_POINTS));
        }

        Ok(Self(points))
    }

    pub fn points(&self) -> &[u8] {
        &self.0
    }

    /// Grid coordinates (row, column) of each point
    pub fn coordinates(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.0
            .iter()
            .map(|p| (p / PATTERN_GRID_SIZE, p % PATTERN_GRID_SIZE))
    }
}

/// A knowledge-factor candidate or credential
pub enum KnowledgeFactor {
    Pin(Pin),
    Pattern(Pattern),
}

impl KnowledgeFactor {
    /// Parse a candidate submitted for the given lock type
    pub fn parse(lock_type: LockType, candidate: &str) -> Result<Self> {
        match lock_type {
            LockType::Pin => Pin::parse(candidate).map(KnowledgeFactor::Pin),
            LockType::Pattern => Pattern::parse(candidate).map(KnowledgeFactor::Pattern),
        }
    }

    pub fn lock_type(&self) -> LockType {
        match self {
            KnowledgeFactor::Pin(_) => LockType::Pin,
            KnowledgeFactor::Pattern(_) => LockType::Pattern,
        }
    }

    /// Canonical byte encoding used for hashing
    ///
    /// Patterns are re-serialized without whitespace so `"0, 1,2,5"` and
    /// `"0,1,2,5"` hash identically.
    pub fn canonical_bytes(&self) -> Zeroizing<Vec<u8>> {
        match self {
            KnowledgeFactor::Pin(pin) => Zeroizing::new(pin.0.as_bytes().to_vec()),
            KnowledgeFactor::Pattern(pattern) => {
                let joined = pattern
                    .points()
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                Zeroizing::new(joined.into_bytes())
            }
        }
    }
}

impl fmt::Debug for KnowledgeFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KnowledgeFactor({}, <redacted>)", self.lock_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_validation() {
        assert!(Pin::parse("123456").is_ok());
        assert_eq!(Pin::parse("12345").err(), Some(Error::InvalidPinLength(6)));
        assert_eq!(Pin::parse("1234567").err(), Some(Error::InvalidPinLength(6)));
        assert_eq!(Pin::parse("12345a").err(), Some(Error::InvalidPinFormat));
    }

    #[test]
    fn test_pattern_validation() {
        assert_eq!(Pattern::parse("0,1,2,5").unwrap().points(), &[0, 1, 2, 5]);
        assert_eq!(Pattern::parse("0,1,2").err(), Some(Error::PatternTooShort(4)));
        assert_eq!(
            Pattern::parse("0,1,2,9").err(),
            Some(Error::PatternPointOutOfRange("9".to_string()))
        );
        assert_eq!(
            Pattern::parse("0,1,0,2").err(),
            Some(Error::PatternRepeatedPoint(0))
        );
        assert!(Pattern::parse("a,b,c,d").is_err());
    }

    #[test]
    fn test_pattern_coordinates() {
        let pattern = Pattern::parse("0,4,8,5").unwrap();
        let coords: Vec<_> = pattern.coordinates().collect();
        assert_eq!(coords, vec![(0, 0), (1, 1), (2, 2), (1, 2)]);
    }

    #[test]
    fn test_canonical_pattern_encoding_ignores_whitespace() {
        let a = KnowledgeFactor::parse(LockType::Pattern, "0, 1,2 ,5").unwrap();
        let b = KnowledgeFactor::parse(LockType::Pattern, "0,1,2,5").unwrap();
        assert_eq!(*a.canonical_bytes(), *b.canonical_bytes());
    }

    #[test]
    fn test_lock_type_decides_format() {
        assert!(KnowledgeFactor::parse(LockType::Pin, "0,1,2,5").is_err());
        assert!(KnowledgeFactor::parse(LockType::Pattern, "123456").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let pin = KnowledgeFactor::parse(LockType::Pin, "123456").unwrap();
        let printed = format!("{:?}", pin);
        assert!(!printed.contains("123456"));
    }
}
