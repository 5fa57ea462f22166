// src/native/mod.rs

//! Native package manager shims
//!
//! Native packages take part in resolution like managed ones, but are queried
//! and installed through the host's own tools. The shim is chosen once per
//! session from the host's OS family.

pub mod debian;
pub mod redhat;

use crate::error::{Error, Result};
use crate::packages::metadata::Metadata;
use crate::platform::{HostPlatform, OsFamily};
use crate::resolver::candidate::{Candidate, Origin};
use crate::version::Version;
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::debug;

pub use debian::Dpkg;
pub use redhat::Rpm;

/// Queries and installs packages of the host's native package manager
pub trait NativePackageManager {
    /// Installed versions of `name` (at most one on most systems)
    fn installed(&self, name: &str) -> Result<Vec<Candidate>>;

    /// Versions of `name` the native manager could install
    fn available(&self, name: &str) -> Result<Vec<Candidate>>;

    fn install(&self, name: &str, version: &Version, package_version: Option<&Version>) -> Result<()>;
}

/// Select the shim for the host's OS family
pub fn for_host(host: &HostPlatform) -> Box<dyn NativePackageManager> {
    match host.family {
        OsFamily::RedHat => Box::new(Rpm::new()),
        OsFamily::Debian => Box::new(Dpkg::new()),
        OsFamily::Other => Box::new(Unsupported),
    }
}

/// Hosts without native package support
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl NativePackageManager for Unsupported {
    fn installed(&self, _name: &str) -> Result<Vec<Candidate>> {
        Ok(Vec::new())
    }

    fn available(&self, _name: &str) -> Result<Vec<Candidate>> {
        Ok(Vec::new())
    }

    fn install(&self, name: &str, version: &Version, _package_version: Option<&Version>) -> Result<()> {
        Err(Error::ExternalFailure {
            command: format!("install native {}-{}", name, version),
            status: "no native package manager on this host".to_string(),
        })
    }
}

/// Per-name memo of native query results
#[derive(Debug, Default)]
pub(crate) struct QueryCache {
    entries: RefCell<HashMap<String, Vec<Candidate>>>,
}

impl QueryCache {
    pub(crate) fn get_or_query<F>(&self, name: &str, query: F) -> Result<Vec<Candidate>>
    where
        F: FnOnce() -> Result<Vec<Candidate>>,
    {
        if let Some(cached) = self.entries.borrow().get(name) {
            return Ok(cached.clone());
        }
        let result = query()?;
        self.entries
            .borrow_mut()
            .insert(name.to_string(), result.clone());
        Ok(result)
    }

    pub(crate) fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

/// Build a native candidate from a queried name, version and release
pub(crate) fn native_candidate(
    name: &str,
    version: &str,
    release: Option<&str>,
    origin: Origin,
) -> Result<Candidate> {
    let mut metadata = Metadata::new(name, Version::parse(version)?);
    metadata.package_version = release
        .filter(|release| !release.is_empty())
        .map(Version::parse)
        .transpose()?;
    Ok(Candidate::new(metadata, origin))
}

/// A failed query means "nothing known" to the resolver
pub(crate) fn query_or_empty(result: Result<String>, what: &str) -> Option<String> {
    match result {
        Ok(output) => Some(output),
        Err(e) => {
            debug!("Native query for {} returned nothing: {}", what, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_cache_queries_once() {
        let cache = QueryCache::default();
        let calls = Cell::new(0);
        let query = || -> Result<Vec<Candidate>> {
            calls.set(calls.get() + 1);
            Ok(vec![native_candidate("zlib", "1.2.11", Some("3"), Origin::InstalledNative)?])
        };

        assert_eq!(cache.get_or_query("zlib", query).unwrap().len(), 1);
        assert_eq!(cache.get_or_query("zlib", query).unwrap().len(), 1);
        assert_eq!(calls.get(), 1);

        cache.clear();
        cache.get_or_query("zlib", query).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_native_candidate() {
        let candidate = native_candidate("bash", "5.2", Some(""), Origin::AvailableNative).unwrap();
        assert!(candidate.metadata.package_version.is_none());
        assert!(candidate.origin.is_native());
        assert!(!candidate.is_installed());
    }

    #[test]
    fn test_unsupported_host() {
        let native = for_host(&HostPlatform::new("Gentoo-2.14", "x86_64"));
        assert!(native.installed("bash").unwrap().is_empty());
        assert!(native.available("bash").unwrap().is_empty());
        let err = native
            .install("bash", &Version::parse("5.2").unwrap(), None)
            .unwrap_err();
        assert!(matches!(err, Error::ExternalFailure { .. }));
    }
}
