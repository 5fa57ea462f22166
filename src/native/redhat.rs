// src/native/redhat.rs

//! rpm/yum shim for Red Hat family hosts

use super::{native_candidate, query_or_empty, NativePackageManager, QueryCache};
use crate::error::Result;
use crate::resolver::candidate::{Candidate, Origin};
use crate::scripts;
use crate::version::Version;
use std::process::Command;
use tracing::{debug, info};

const QUERY_FORMAT: &str = "%{NAME}\\t%{VERSION}\\t%{RELEASE}\\n";

#[derive(Debug, Default)]
pub struct Rpm {
    installed: QueryCache,
    available: QueryCache,
}

impl Rpm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NativePackageManager for Rpm {
    fn installed(&self, name: &str) -> Result<Vec<Candidate>> {
        self.installed.get_or_query(name, || {
            let output = query_or_empty(
                scripts::run(Command::new("rpm").args(["-q", "--queryformat", QUERY_FORMAT]).arg(name)),
                name,
            );
            match output {
                Some(output) => parse_rpm_query(name, &output),
                None => Ok(Vec::new()),
            }
        })
    }

    fn available(&self, name: &str) -> Result<Vec<Candidate>> {
        self.available.get_or_query(name, || {
            let output = query_or_empty(
                scripts::run(
                    Command::new("yum")
                        .args(["-q", "list", "available", "--showduplicates"])
                        .arg(name),
                ),
                name,
            );
            match output {
                Some(output) => parse_yum_list(name, &output),
                None => Ok(Vec::new()),
            }
        })
    }

    fn install(&self, name: &str, version: &Version, package_version: Option<&Version>) -> Result<()> {
        let target = match package_version {
            Some(release) => format!("{}-{}-{}", name, version, release),
            None => format!("{}-{}", name, version),
        };
        info!("Installing native package {}", target);

        scripts::run(Command::new("yum").args(["-y", "install"]).arg(&target))?;

        self.installed.clear();
        self.available.clear();
        Ok(())
    }
}

/// Parse `rpm -q --queryformat '%{NAME}\t%{VERSION}\t%{RELEASE}\n'` output
fn parse_rpm_query(name: &str, output: &str) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if let [found, version, release] = fields.as_slice() {
            if *found == name {
                candidates.push(native_candidate(name, version, Some(*release), Origin::InstalledNative)?);
            }
        }
    }
    Ok(candidates)
}

/// Parse `yum list available --showduplicates` output.
///
/// Lines look like `nginx.x86_64   1:1.20.1-10.el9   appstream`; headers
/// and wrapped lines are skipped.
fn parse_yum_list(name: &str, output: &str) -> Result<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [package, evr, _repo] = fields.as_slice() else {
            continue;
        };
        let Some((found, _arch)) = package.rsplit_once('.') else {
            continue;
        };
        if found != name {
            continue;
        }

        let without_epoch = evr.split_once(':').map_or(*evr, |(_, rest)| rest);
        let (version, release) = match without_epoch.rsplit_once('-') {
            Some((version, release)) => (version, Some(release)),
            None => (without_epoch, None),
        };

        let candidate = native_candidate(name, version, release, Origin::AvailableNative)?;
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    debug!("yum offers {} version(s) of {}", candidates.len(), name);
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rpm_query() {
        let candidates = parse_rpm_query("openssl", "openssl\t3.0.7\t24.el9\n").unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].metadata.label(), "openssl-3.0.7-24.el9");
        assert!(candidates[0].is_installed());

        assert!(parse_rpm_query("openssl", "package openssl is not installed\n")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_parse_yum_list() {
        let output = "\
Available Packages
nginx.x86_64                 1:1.20.1-10.el9                 appstream
nginx.x86_64                 1:1.20.1-13.el9                 appstream
nginx-core.x86_64            1:1.20.1-13.el9                 appstream
";
        let candidates = parse_yum_list("nginx", output).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].metadata.version.as_str(), "1.20.1");
        assert_eq!(
            candidates[1].metadata.package_version.as_ref().unwrap().as_str(),
            "13.el9"
        );
        assert!(candidates.iter().all(|c| c.origin == Origin::AvailableNative));
    }
}
