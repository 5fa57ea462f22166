// src/packages/traits.rs

//! Interfaces between the transaction engine and its collaborators

use crate::error::Result;
use crate::packages::metadata::{External, Manifest, Metadata};
use std::path::{Path, PathBuf};

/// Reads managed package archives
pub trait ArchiveReader {
    /// Read the metadata of an archive, verifying its embedded checksum
    fn read_metadata(&self, path: &Path) -> Result<Metadata>;

    /// Paths (relative to the install root) the archive would install
    fn payload_files(&self, path: &Path) -> Result<Vec<String>>;
}

/// Options for applying an archive to the host
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    pub passphrase: Option<String>,
    /// Externals shared by the old and new version during an upgrade
    pub externals_to_skip: Vec<External>,
    /// The package replaces a version removed moments ago
    pub upgrading: bool,
}

/// Applies an archive to the host: extraction, ownership and permissions,
/// install hooks and externals
pub trait Unpacker {
    fn apply(&self, archive: &Path, options: &UnpackOptions) -> Result<Manifest>;
}

/// Persistent record of installed managed packages
pub trait InstalledStore {
    fn list_installed(&self) -> Result<Vec<Metadata>>;

    /// Files recorded for an installed package
    fn manifest(&self, name: &str) -> Result<Manifest>;

    /// `(path, owning package)` for every non-directory file installed
    fn file_owners(&self) -> Result<Vec<(String, String)>>;

    fn record_installed(&self, metadata: &Metadata, manifest: &Manifest) -> Result<()>;

    fn forget_installed(&self, name: &str) -> Result<()>;
}

/// A managed package offered by a source
#[derive(Debug, Clone)]
pub struct AvailablePackage {
    pub metadata: Metadata,
    /// Source URL, local directory, or archive path
    pub location: String,
}

/// Index of managed packages available from configured sources
pub trait AvailableIndex {
    fn list_available(&self) -> Result<Vec<AvailablePackage>>;
}

/// Downloads archives from remote sources
pub trait Fetcher {
    /// Fetch `filename` from `source`, returning a verified local path
    fn fetch(&self, source: &str, filename: &str) -> Result<PathBuf>;
}

/// Receives the manifest of every newly applied package
pub trait Reporter {
    fn report(&self, manifest: &Manifest) -> Result<()>;
}

/// Asks the operator to approve a pending change
pub trait Confirm {
    /// `action` is a past participle ("installed", "removed"); `items` are labels
    fn confirm(&self, action: &str, items: &[String]) -> Result<bool>;
}

/// Approves everything without asking
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _action: &str, _items: &[String]) -> Result<bool> {
        Ok(true)
    }
}
