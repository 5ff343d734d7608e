//! Version constraints carried by `call.version`.
//!
//! A constraint is either absent (latest stable), an exact semantic version
//! (prerelease tags included), or a semantic range.

use std::fmt;

use semver::{Version, VersionReq};

/// Parsed form of the optional `call.version` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// No version requested: highest stable version wins.
    Latest,
    /// An exact version string. Matches only an identical registration.
    Exact(Version),
    /// A semantic range such as `^1.2` or `>=1.0.0, <2.0.0`.
    Range(VersionReq),
}

/// The version string is neither an exact version nor a range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version constraint `{input}`: {reason}")]
pub struct VersionConstraintError {
    pub input: String,
    pub reason: String,
}

impl VersionConstraint {
    /// Parses an optional constraint string.
    ///
    /// A full `major.minor.patch[-pre][+build]` string is exact; anything else
    /// is tried as a range.
    ///
    /// # Errors
    ///
    /// Returns [`VersionConstraintError`] when the string is blank or parses
    /// as neither form.
    pub fn parse(input: Option<&str>) -> Result<Self, VersionConstraintError> {
        let Some(raw) = input else {
            return Ok(Self::Latest);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(VersionConstraintError {
                input: raw.to_string(),
                reason: "empty version".to_string(),
            });
        }
        if let Ok(version) = Version::parse(trimmed) {
            return Ok(Self::Exact(version));
        }
        VersionReq::parse(trimmed)
            .map(Self::Range)
            .map_err(|e| VersionConstraintError {
                input: raw.to_string(),
                reason: e.to_string(),
            })
    }

    /// Whether a registered version satisfies this constraint.
    ///
    /// `Latest` admits stable versions only. `Range` defers to semver range
    /// matching, which excludes prereleases unless a comparator names a
    /// prerelease on the same `major.minor.patch`.
    #[must_use]
    pub fn admits(&self, version: &Version) -> bool {
        match self {
            Self::Latest => version.pre.is_empty(),
            Self::Exact(exact) => exact == version,
            Self::Range(req) => req.matches(version),
        }
    }

    #[must_use]
    pub fn is_latest(&self) -> bool {
        matches!(self, Self::Latest)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::Range(req) => write!(f, "{req}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn absent_is_latest() {
        assert_eq!(VersionConstraint::parse(None).unwrap(), VersionConstraint::Latest);
    }

    #[test]
    fn full_version_is_exact() {
        let c = VersionConstraint::parse(Some("3.0.0-alpha.1")).unwrap();
        assert_eq!(c, VersionConstraint::Exact(v("3.0.0-alpha.1")));
    }

    #[test]
    fn partial_version_is_range() {
        let c = VersionConstraint::parse(Some("1.2")).unwrap();
        assert!(matches!(c, VersionConstraint::Range(_)));
        assert!(c.admits(&v("1.9.0")));
        assert!(!c.admits(&v("2.0.0")));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = VersionConstraint::parse(Some("not-a-version")).unwrap_err();
        assert_eq!(err.input, "not-a-version");
        assert!(VersionConstraint::parse(Some("  ")).is_err());
    }

    #[test]
    fn latest_admits_only_stable() {
        let c = VersionConstraint::Latest;
        assert!(c.admits(&v("2.0.0")));
        assert!(!c.admits(&v("3.0.0-alpha.1")));
    }

    #[test]
    fn exact_requires_identical_prerelease() {
        let c = VersionConstraint::parse(Some("3.0.0-alpha.1")).unwrap();
        assert!(c.admits(&v("3.0.0-alpha.1")));
        assert!(!c.admits(&v("3.0.0-alpha.2")));
        assert!(!c.admits(&v("3.0.0")));
    }

    #[test]
    fn range_excludes_prerelease_unless_targeted() {
        let stable = VersionConstraint::parse(Some(">=1.0.0")).unwrap();
        assert!(!stable.admits(&v("3.0.0-alpha.1")));

        let channel = VersionConstraint::parse(Some(">=3.0.0-alpha.0")).unwrap();
        assert!(channel.admits(&v("3.0.0-alpha.1")));
        assert!(channel.admits(&v("3.1.0")));
    }

    #[test]
    fn display_roundtrips_exact() {
        let c = VersionConstraint::parse(Some("1.0.0")).unwrap();
        assert_eq!(c.to_string(), "1.0.0");
        assert_eq!(VersionConstraint::Latest.to_string(), "latest");
    }
}
