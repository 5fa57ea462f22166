// src/packages/metadata.rs

//! Package metadata and installed-file manifests

use crate::packages::requirement::Requirement;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Archive file extension for managed packages
pub const ARCHIVE_EXTENSION: &str = "hpkg";

/// Everything hostpkg knows about one package version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Archive file name; derived from name and versions when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Supported operating systems; empty means any
    #[serde(default)]
    pub operating_systems: BTreeSet<String>,
    /// Supported architectures; empty means any
    #[serde(default)]
    pub architectures: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<Requirement>,
    #[serde(default)]
    pub conflicts: Vec<Requirement>,
    #[serde(default)]
    pub externals: Vec<External>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
}

impl Metadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            package_version: None,
            description: None,
            filename: None,
            operating_systems: BTreeSet::new(),
            architectures: BTreeSet::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            externals: Vec::new(),
            files: Vec::new(),
        }
    }

    /// The archive file name for this package
    pub fn filename(&self) -> String {
        match &self.filename {
            Some(filename) => filename.clone(),
            None => match &self.package_version {
                Some(pv) => format!(
                    "{}-{}-{}.{}",
                    self.name, self.version, pv, ARCHIVE_EXTENSION
                ),
                None => format!("{}-{}.{}", self.name, self.version, ARCHIVE_EXTENSION),
            },
        }
    }

    /// Human-readable `name-version[-packageVersion]`
    pub fn label(&self) -> String {
        match &self.package_version {
            Some(pv) => format!("{}-{}-{}", self.name, self.version, pv),
            None => format!("{}-{}", self.name, self.version),
        }
    }

    /// Declared files that are init scripts, with their start priority
    pub fn init_scripts(&self) -> impl Iterator<Item = (&FileSpec, u32)> {
        self.files
            .iter()
            .filter_map(|file| file.init.as_ref().map(|init| (file, init.start)))
    }

    /// Declared files that are crontabs
    pub fn crontabs(&self) -> impl Iterator<Item = &FileSpec> {
        self.files.iter().filter(|file| file.crontab.is_some())
    }

    pub fn file_spec(&self, path: &str) -> Option<&FileSpec> {
        let normalized = path.trim_start_matches('/');
        self.files
            .iter()
            .find(|file| file.path.trim_start_matches('/') == normalized)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Properties declared for one payload path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path relative to the install root
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Locally modified config files survive removal
    #[serde(default)]
    pub config: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crontab: Option<CrontabSpec>,
}

impl FileSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            owner: None,
            group: None,
            mode: None,
            config: false,
            init: None,
            crontab: None,
        }
    }
}

/// Init script wiring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSpec {
    /// Start priority; services stop in descending order
    #[serde(default = "default_start_priority")]
    pub start: u32,
}

fn default_start_priority() -> u32 {
    99
}

/// Crontab wiring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrontabSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// An external: a host-provided script run with package data at install and removal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct External {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One installed path of a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute path on the host
    pub path: String,
    /// SHA-256 of the content; empty for directories and symlinks
    pub sha256: String,
    pub size: i64,
    pub mode: u32,
    #[serde(default)]
    pub config: bool,
    #[serde(default)]
    pub directory: bool,
}

/// Files installed by one package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub package: String,
    pub version: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(metadata: &Metadata) -> Self {
        Self {
            package: metadata.name.clone(),
            version: metadata.label(),
            files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_derivation() {
        let mut meta = Metadata::new("nginx", Version::parse("1.21").unwrap());
        assert_eq!(meta.filename(), "nginx-1.21.hpkg");

        meta.package_version = Some(Version::parse("2").unwrap());
        assert_eq!(meta.filename(), "nginx-1.21-2.hpkg");
        assert_eq!(meta.label(), "nginx-1.21-2");

        meta.filename = Some("custom.hpkg".to_string());
        assert_eq!(meta.filename(), "custom.hpkg");
    }

    #[test]
    fn test_deserialize_minimal_metadata() {
        let meta: Metadata = serde_json::from_str(
            r#"{
                "name": "app",
                "version": "1.0",
                "dependencies": [{"name": "lib", "min_version": "2.0"}],
                "files": [
                    {"path": "etc/init.d/app", "init": {"start": 20}},
                    {"path": "etc/cron.d/app", "crontab": {}},
                    {"path": "etc/app.conf", "config": true}
                ]
            }"#,
        )
        .unwrap();

        assert!(meta.operating_systems.is_empty());
        assert_eq!(meta.dependencies.len(), 1);
        let inits: Vec<_> = meta.init_scripts().map(|(f, start)| (f.path.clone(), start)).collect();
        assert_eq!(inits, vec![("etc/init.d/app".to_string(), 20)]);
        assert_eq!(meta.crontabs().count(), 1);
        assert!(meta.file_spec("/etc/app.conf").unwrap().config);
    }
}
