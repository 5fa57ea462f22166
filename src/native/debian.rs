// src/native/debian.rs

//! dpkg/apt shim for Debian and Ubuntu hosts
//!
//! Debian versions look like `[epoch:]upstream[-revision]`. The epoch is
//! dropped, the upstream part becomes the version and the revision becomes
//! the package version.

use super::{native_candidate, query_or_empty, NativePackageManager, QueryCache};
use crate::error::{Error, Result};
use crate::resolver::candidate::{Candidate, Origin};
use crate::scripts;
use crate::version::Version;
use serde::Deserialize;
use std::process::Command;
use tracing::{debug, info};

/// One stanza of `apt-cache show` output
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AptCacheEntry {
    package: String,
    version: String,
}

#[derive(Debug, Default)]
pub struct Dpkg {
    installed: QueryCache,
    available: QueryCache,
}

impl Dpkg {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NativePackageManager for Dpkg {
    fn installed(&self, name: &str) -> Result<Vec<Candidate>> {
        self.installed.get_or_query(name, || {
            let output = query_or_empty(
                scripts::run(
                    Command::new("dpkg-query")
                        .args(["-W", "-f", "${Status}\\t${Version}\\n"])
                        .arg(name),
                ),
                name,
            );
            match output {
                Some(output) => parse_dpkg_query(name, &output),
                None => Ok(Vec::new()),
            }
        })
    }

    fn available(&self, name: &str) -> Result<Vec<Candidate>> {
        self.available.get_or_query(name, || {
            match query_or_empty(scripts::run(Command::new("apt-cache").arg("show").arg(name)), name) {
                Some(output) => parse_apt_cache_show(name, &output),
                None => Ok(Vec::new()),
            }
        })
    }

    fn install(&self, name: &str, version: &Version, package_version: Option<&Version>) -> Result<()> {
        let target = match package_version {
            Some(revision) => format!("{}={}-{}", name, version, revision),
            None => format!("{}={}", name, version),
        };
        info!("Installing native package {}", target);

        scripts::run(
            Command::new("apt-get")
                .env("DEBIAN_FRONTEND", "noninteractive")
                .args(["-y", "install"])
                .arg(&target),
        )?;

        self.installed.clear();
        self.available.clear();
        Ok(())
    }
}

/// Split `[epoch:]upstream[-revision]`
pub fn split_version(version: &str) -> (&str, Option<&str>) {
    let without_epoch = match version.split_once(':') {
        Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => version,
    };
    match without_epoch.rsplit_once('-') {
        Some((upstream, revision)) => (upstream, Some(revision)),
        None => (without_epoch, None),
    }
}

/// Parse `dpkg-query -W -f '${Status}\t${Version}\n'` output
fn parse_dpkg_query(name: &str, output: &str) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    for line in output.lines() {
        let Some((status, version)) = line.split_once('\t') else {
            continue;
        };
        // "install ok installed"; half-removed packages report other states
        if !status.trim().ends_with(" installed") || version.trim().is_empty() {
            debug!("Skipping {} in state '{}'", name, status.trim());
            continue;
        }
        let (upstream, revision) = split_version(version.trim());
        candidates.push(native_candidate(name, upstream, revision, Origin::InstalledNative)?);
    }
    Ok(candidates)
}

/// Parse `apt-cache show` stanzas for `name`
fn parse_apt_cache_show(name: &str, output: &str) -> Result<Vec<Candidate>> {
    let entries: Vec<AptCacheEntry> = rfc822_like::from_str(output)
        .map_err(|e| Error::ParseError(format!("Failed to parse apt-cache output: {}", e)))?;

    let mut candidates: Vec<Candidate> = Vec::new();
    for entry in entries.into_iter().filter(|entry| entry.package == name) {
        let (upstream, revision) = split_version(&entry.version);
        let candidate = native_candidate(name, upstream, revision, Origin::AvailableNative)?;
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    debug!("apt-cache knows {} version(s) of {}", candidates.len(), name);
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_version() {
        assert_eq!(split_version("1:2.34-0ubuntu3"), ("2.34", Some("0ubuntu3")));
        assert_eq!(split_version("5.1"), ("5.1", None));
        assert_eq!(split_version("1.2-3-4"), ("1.2-3", Some("4")));
    }

    #[test]
    fn test_parse_dpkg_query() {
        let candidates = parse_dpkg_query("bash", "install ok installed\t5.1-6ubuntu1\n").unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].metadata.version.as_str(), "5.1");
        assert_eq!(
            candidates[0].metadata.package_version.as_ref().unwrap().as_str(),
            "6ubuntu1"
        );
        assert_eq!(candidates[0].origin, Origin::InstalledNative);

        let removed = parse_dpkg_query("bash", "deinstall ok config-files\t5.1-6\n").unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn test_parse_apt_cache_show() {
        let output = "\
Package: curl
Version: 7.81.0-1ubuntu1.15
Architecture: amd64
Description: command line tool for transferring data with URL syntax

Package: curl
Version: 7.81.0-1
Architecture: amd64
Description: command line tool for transferring data with URL syntax
";
        let candidates = parse_apt_cache_show("curl", output).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.origin == Origin::AvailableNative));
        assert_eq!(candidates[1].metadata.label(), "curl-7.81.0-1");
    }
}
