// src/platform.rs

//! Host platform detection
//!
//! Package metadata restricts packages to operating systems (`Ubuntu-22.04`,
//! `RedHat`) and architectures (`x86_64`). The host is described once per
//! session and matched against those lists.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use tracing::debug;

const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Operating system families with native package manager support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    /// RPM based: Red Hat, CentOS, Fedora, Rocky, Alma
    RedHat,
    /// dpkg based: Debian, Ubuntu
    Debian,
    /// Anything else; no native package support
    Other,
}

/// The operating system and architecture packages are resolved for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    /// `Name-Version`, e.g. `Ubuntu-22.04`
    pub os: String,
    pub family: OsFamily,
    pub arch: String,
}

impl HostPlatform {
    /// Describe a host explicitly
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        let os = os.into();
        let family = family_for(os_name(&os));
        Self {
            os,
            family,
            arch: arch.into(),
        }
    }

    /// Detect the running host from `/etc/os-release` and the compile target
    pub fn detect() -> Self {
        let os = match fs::read_to_string(OS_RELEASE_PATH) {
            Ok(content) => os_from_release(&content),
            Err(e) => {
                debug!("Unable to read {}: {}", OS_RELEASE_PATH, e);
                capitalize(std::env::consts::OS)
            }
        };
        let host = Self::new(os, std::env::consts::ARCH);
        debug!("Detected host platform: {}", host);
        host
    }

    /// Whether a package's operating system list admits this host.
    ///
    /// An empty list is a wildcard. Entries may name the full `Name-Version`
    /// string or just the OS name; matching ignores case.
    pub fn matches_os(&self, operating_systems: &BTreeSet<String>) -> bool {
        if operating_systems.is_empty() {
            return true;
        }
        let name = os_name(&self.os);
        operating_systems
            .iter()
            .any(|os| os.eq_ignore_ascii_case(&self.os) || os.eq_ignore_ascii_case(name))
    }

    /// Whether a package's architecture list admits this host (empty = any)
    pub fn matches_arch(&self, architectures: &BTreeSet<String>) -> bool {
        architectures.is_empty()
            || architectures
                .iter()
                .any(|arch| arch.eq_ignore_ascii_case(&self.arch))
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.os, self.arch)
    }
}

fn os_name(os: &str) -> &str {
    os.split('-').next().unwrap_or(os)
}

fn family_for(name: &str) -> OsFamily {
    match name.to_ascii_lowercase().as_str() {
        "redhat" | "rhel" | "centos" | "fedora" | "rocky" | "almalinux" => OsFamily::RedHat,
        "debian" | "ubuntu" => OsFamily::Debian,
        _ => OsFamily::Other,
    }
}

/// Build the `Name-Version` string from os-release content
fn os_from_release(content: &str) -> String {
    let mut id = None;
    let mut version = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "ID" => id = Some(value.to_string()),
            "VERSION_ID" => version = Some(value.to_string()),
            _ => {}
        }
    }

    let name = match id.as_deref() {
        Some("rhel") => "RedHat".to_string(),
        Some("centos") => "CentOS".to_string(),
        Some("almalinux") => "AlmaLinux".to_string(),
        Some(other) => capitalize(other),
        None => capitalize(std::env::consts::OS),
    };

    match version {
        Some(version) => format!("{}-{}", name, version),
        None => name,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_os_from_release() {
        let ubuntu = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n";
        assert_eq!(os_from_release(ubuntu), "Ubuntu-22.04");

        let rhel = "ID=\"rhel\"\nVERSION_ID=\"9.3\"\n";
        assert_eq!(os_from_release(rhel), "RedHat-9.3");
    }

    #[test]
    fn test_family_detection() {
        assert_eq!(HostPlatform::new("Ubuntu-22.04", "x86_64").family, OsFamily::Debian);
        assert_eq!(HostPlatform::new("CentOS-7", "x86_64").family, OsFamily::RedHat);
        assert_eq!(HostPlatform::new("Darwin", "aarch64").family, OsFamily::Other);
    }

    #[test]
    fn test_os_matching() {
        let host = HostPlatform::new("Ubuntu-22.04", "x86_64");
        assert!(host.matches_os(&set(&[])));
        assert!(host.matches_os(&set(&["ubuntu"])));
        assert!(host.matches_os(&set(&["RedHat", "Ubuntu-22.04"])));
        assert!(!host.matches_os(&set(&["Ubuntu-20.04"])));
        assert!(!host.matches_os(&set(&["Debian"])));
    }

    #[test]
    fn test_arch_matching() {
        let host = HostPlatform::new("Ubuntu-22.04", "x86_64");
        assert!(host.matches_arch(&set(&[])));
        assert!(host.matches_arch(&set(&["i386", "x86_64"])));
        assert!(!host.matches_arch(&set(&["aarch64"])));
    }
}
