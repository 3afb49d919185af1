//! Engine release version.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Returned when a string is not `<int>.<int>.<int>`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("version '{input}' does not match <major>.<medium>.<minor>: {reason}")]
pub struct FormatError {
    pub input: String,
    pub reason: String,
}

impl FormatError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A released engine version, `major.medium.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u32,
    pub medium: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, medium: u32, minor: u32) -> Self {
        Self {
            major,
            medium,
            minor,
        }
    }

    /// Parse `1.2.3` or `v1.2.3`.
    pub fn parse(input: &str) -> Result<Self, FormatError> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(FormatError::new(input, "empty"));
        }

        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(FormatError::new(
                input,
                format!("expected 3 components, got {}", parts.len()),
            ));
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FormatError::new(input, format!("'{part}' is not a number")));
            }
            *slot = part
                .parse()
                .map_err(|e| FormatError::new(input, format!("'{part}': {e}")))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }

    /// True if this version is at least `other`.
    pub fn at_least(&self, other: &Version) -> bool {
        self.compare(other) != Ordering::Less
    }

    /// Numeric comparison, component by component.
    pub fn compare(&self, other: &Version) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.medium.cmp(&other.medium))
            .then(self.minor.cmp(&other.minor))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.medium, self.minor)
    }
}

impl FromStr for Version {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2.4.3", Version::new(2, 4, 3))]
    #[case("v2.4.3", Version::new(2, 4, 3))]
    #[case(" 10.0.12 ", Version::new(10, 0, 12))]
    fn test_parse_valid(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(Version::parse(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("v")]
    #[case("2.4")]
    #[case("2.4.3.1")]
    #[case("2.x.3")]
    #[case("2..3")]
    #[case("-2.4.3")]
    #[case("main")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(Version::parse(input).is_err(), "{input} should not parse");
    }

    #[test]
    fn test_numeric_not_lexical_ordering() {
        let older = Version::parse("2.9.0").unwrap();
        let newer = Version::parse("2.10.0").unwrap();
        assert!(newer > older);
        assert!("2.10.0" < "2.9.0", "lexical ordering would get this wrong");
    }

    #[test]
    fn test_at_least() {
        let minimum = Version::new(2, 18, 0);
        assert!(Version::new(2, 18, 0).at_least(&minimum));
        assert!(Version::new(2, 18, 1).at_least(&minimum));
        assert!(!Version::new(2, 17, 9).at_least(&minimum));
    }

    #[test]
    fn test_display_drops_prefix() {
        assert_eq!(Version::parse("v1.2.3").unwrap().to_string(), "1.2.3");
    }

    #[test]
    fn test_error_message() {
        let err = Version::parse("2.4").unwrap_err();
        assert!(err.to_string().contains("expected 3 components"));
    }
}
