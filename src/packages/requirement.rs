// src/packages/requirement.rs

//! Requirements: named version constraints a chosen package must satisfy

use crate::error::{Error, Result};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which package universe a requirement is resolved against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementKind {
    /// Packages in hostpkg's own archive format
    #[default]
    Managed,
    /// Packages of the host's native package manager
    Native,
}

/// A named constraint.
///
/// Package-version bounds only apply when the candidate's version equals the
/// corresponding version bound exactly. Several requirements for the same
/// name are conjunctive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_package_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_package_version: Option<Version>,
    #[serde(default)]
    pub kind: RequirementKind,
}

impl Requirement {
    /// Any version of a managed package
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_version: None,
            max_version: None,
            min_package_version: None,
            max_package_version: None,
            kind: RequirementKind::Managed,
        }
    }

    /// Any version of a native package
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            kind: RequirementKind::Native,
            ..Self::named(name)
        }
    }

    /// Exactly `version` (and `package_version`, when given)
    pub fn exact(
        name: impl Into<String>,
        version: Version,
        package_version: Option<Version>,
    ) -> Self {
        Self {
            min_version: Some(version.clone()),
            max_version: Some(version),
            min_package_version: package_version.clone(),
            max_package_version: package_version,
            ..Self::named(name)
        }
    }

    /// At least `version` (and `package_version` at that version)
    pub fn at_least(
        name: impl Into<String>,
        version: Version,
        package_version: Option<Version>,
    ) -> Self {
        Self {
            min_version: Some(version),
            min_package_version: package_version,
            ..Self::named(name)
        }
    }

    /// Parse a by-name request: `name`, `name=version` or
    /// `name=version=packageVersion`
    pub fn parse(request: &str) -> Result<Self> {
        let parts: Vec<&str> = request.trim().split('=').collect();

        let name = parts[0];
        if !is_valid_name(name) {
            return Err(Error::ParseError(format!(
                "Invalid package request '{}'",
                request
            )));
        }

        match parts.as_slice() {
            [_] => Ok(Self::named(name)),
            [_, version] => Ok(Self::exact(name, Version::parse(version)?, None)),
            [_, version, package_version] => Ok(Self::exact(
                name,
                Version::parse(version)?,
                Some(Version::parse(package_version)?),
            )),
            _ => Err(Error::ParseError(format!(
                "Invalid package request '{}': expected name[=version[=package_version]]",
                request
            ))),
        }
    }

    pub fn is_native(&self) -> bool {
        self.kind == RequirementKind::Native
    }
}

/// Package names: ASCII alphanumerics plus `-`, `_`, `+` and `.`, not starting
/// with a separator.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_native() {
            write!(f, "native:")?;
        }
        write!(f, "{}", self.name)?;

        if self.min_version.is_some() && self.min_version == self.max_version {
            if let Some(version) = &self.min_version {
                write!(f, "={}", version)?;
            }
            if let Some(pv) = &self.min_package_version {
                write!(f, "={}", pv)?;
            }
            return Ok(());
        }

        if let Some(min) = &self.min_version {
            write!(f, " >= {}", min)?;
            if let Some(pv) = &self.min_package_version {
                write!(f, "-{}", pv)?;
            }
        }
        if let Some(max) = &self.max_version {
            write!(f, " <= {}", max)?;
            if let Some(pv) = &self.max_package_version {
                write!(f, "-{}", pv)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let req = Requirement::parse("nginx").unwrap();
        assert_eq!(req.name, "nginx");
        assert!(req.min_version.is_none());
        assert!(req.max_version.is_none());
        assert_eq!(req.kind, RequirementKind::Managed);
    }

    #[test]
    fn test_parse_name_and_version() {
        let req = Requirement::parse("nginx=1.21").unwrap();
        assert_eq!(req.min_version, Some(Version::parse("1.21").unwrap()));
        assert_eq!(req.max_version, req.min_version);
        assert!(req.min_package_version.is_none());
    }

    #[test]
    fn test_parse_with_package_version() {
        let req = Requirement::parse("nginx=2.0=3").unwrap();
        assert_eq!(req.min_package_version, Some(Version::parse("3").unwrap()));
        assert_eq!(req.max_package_version, req.min_package_version);
        assert_eq!(req.to_string(), "nginx=2.0=3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Requirement::parse("").is_err());
        assert!(Requirement::parse("=1.0").is_err());
        assert!(Requirement::parse("a=1=2=3").is_err());
        assert!(Requirement::parse("a=").is_err());
        assert!(Requirement::parse("some/path.hpkg").is_err());
        assert!(Requirement::parse("two words").is_err());
    }

    #[test]
    fn test_deserialize_dependency() {
        let req: Requirement =
            serde_json::from_str(r#"{"name": "libfoo", "min_version": "1.2", "kind": "native"}"#)
                .unwrap();
        assert!(req.is_native());
        assert_eq!(req.to_string(), "native:libfoo >= 1.2");
    }
}
