//! OWS Version Model and Negotiation
//!
//! This module provides the three-component service version used throughout
//! request classification, plus the two OGC-mandated version negotiation
//! algorithms consumed by capabilities operations.

use std::fmt;
use std::str::FromStr;

use crate::error::{OwsError, ServiceException};
use crate::OwsResult;

/// A three-component, totally ordered service version ("major.minor.patch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Normalizes a client-supplied version string.
    ///
    /// A bare major ("2") becomes "2.0.0", major.minor becomes major.minor.0,
    /// and the empty string means "no version given". Anything else is an
    /// `InvalidParameterValue(version)` fault.
    pub fn normalize(s: &str) -> OwsResult<Option<Version>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }

        let invalid = || {
            OwsError::from(ServiceException::invalid_parameter(
                "version",
                format!("Invalid version string '{}'", s),
            ))
        };

        let mut parts = [0u32; 3];
        let mut count = 0;
        for part in s.split('.') {
            if count == 3 {
                return Err(invalid());
            }
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[count] = part.parse().map_err(|_| invalid())?;
            count += 1;
        }

        Ok(Some(Version::new(parts[0], parts[1], parts[2])))
    }

    /// Whether all three components fit the CITE conformance rule (<= 99).
    pub fn is_cite_compliant(&self) -> bool {
        self.major <= 99 && self.minor <= 99 && self.patch <= 99
    }
}

impl FromStr for Version {
    type Err = OwsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::normalize(s)?.ok_or_else(|| {
            ServiceException::invalid_parameter("version", "Empty version string").into()
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Classic OWS version negotiation.
///
/// With no client preference the highest provided version wins. Otherwise the
/// highest version in the intersection wins, and if the intersection is empty
/// the result clamps to the provided version nearest the client's highest
/// preference: the greatest provided version not exceeding it, or the lowest
/// provided version when the client's preferences sit below everything the
/// service offers.
///
/// Returns `None` only when `provided` is empty.
pub fn negotiate(provided: &[Version], accepted: &[Version]) -> Option<Version> {
    let highest = provided.iter().max().copied()?;

    if accepted.is_empty() {
        return Some(highest);
    }

    if let Some(best) = accepted
        .iter()
        .filter(|v| provided.contains(v))
        .max()
        .copied()
    {
        return Some(best);
    }

    let target = accepted.iter().max().copied()?;
    match provided.iter().filter(|v| **v <= target).max().copied() {
        Some(nearest) => Some(nearest),
        None => provided.iter().min().copied(),
    }
}

/// Strict-ordered version negotiation.
///
/// Scans the client's preference list in order and returns the first version
/// the service provides. No nearest-match fallback: an empty scan is a
/// `VersionNegotiationFailed` fault.
pub fn negotiate_ordered(provided: &[Version], accepted: &[Version]) -> OwsResult<Version> {
    accepted
        .iter()
        .find(|v| provided.contains(v))
        .copied()
        .ok_or_else(|| ServiceException::version_negotiation_failed().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(Version::normalize("2").unwrap(), Some(Version::new(2, 0, 0)));
        assert_eq!(
            Version::normalize("2.1").unwrap(),
            Some(Version::new(2, 1, 0))
        );
        assert_eq!(
            Version::normalize("2.1.3").unwrap(),
            Some(Version::new(2, 1, 3))
        );
        assert_eq!(Version::normalize("").unwrap(), None);
        assert_eq!(Version::normalize("  ").unwrap(), None);
    }

    #[test]
    fn test_normalization_rejects_malformed() {
        for bad in ["abc", "1.x", "1..0", "1.0.0.0", "-1", "1.0-beta"] {
            assert!(Version::normalize(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_ordering() {
        assert!(v("2.0.0") > v("1.1.0"));
        assert!(v("1.1.0") > v("1.0.0"));
        assert!(v("1.0.1") > v("1.0.0"));
    }

    #[test]
    fn test_cite_compliance() {
        assert!(v("2.0.0").is_cite_compliant());
        assert!(!Version::new(100, 0, 0).is_cite_compliant());
    }

    #[test]
    fn test_classic_negotiation() {
        let provided = [v("1.0.0"), v("1.1.0"), v("2.0.0")];

        assert_eq!(
            negotiate(&provided, &[v("1.1.0"), v("1.0.0")]),
            Some(v("1.1.0"))
        );
        assert_eq!(negotiate(&provided, &[]), Some(v("2.0.0")));
        // Client below everything provided: clamp to lowest.
        assert_eq!(negotiate(&provided, &[v("0.5.0")]), Some(v("1.0.0")));
        // Client above everything provided: clamp to highest.
        assert_eq!(negotiate(&provided, &[v("3.0.0")]), Some(v("2.0.0")));
        // Nearest provided version not exceeding the client's preference.
        assert_eq!(negotiate(&provided, &[v("1.5.0")]), Some(v("1.1.0")));
        assert_eq!(negotiate(&[], &[v("1.0.0")]), None);
    }

    #[test]
    fn test_ordered_negotiation() {
        let provided = [v("1.0.0"), v("2.0.0")];

        // First match in preference order, not the highest match.
        assert_eq!(
            negotiate_ordered(&provided, &[v("1.5.0"), v("1.0.0")]).unwrap(),
            v("1.0.0")
        );
        let err = negotiate_ordered(&provided, &[v("9.9.9")]).unwrap_err();
        match err {
            OwsError::Fault(se) => {
                assert_eq!(se.code.as_deref(), Some("VersionNegotiationFailed"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
