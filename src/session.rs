// src/session.rs

//! Per-invocation context
//!
//! Everything an operation needs to know about where it runs and how it was
//! asked to behave: install root, state directory, host platform and the
//! operator's flags. Built once by the CLI and passed to every component.

use crate::error::Result;
use crate::platform::HostPlatform;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "/";
pub const DEFAULT_BASE: &str = "/var/lib/hostpkg";

const DB_FILE: &str = "hostpkg.db";

#[derive(Debug, Clone)]
pub struct Session {
    /// Install root packages are unpacked under
    pub root: PathBuf,
    /// State directory: database, lock, archived packages, cached hooks
    pub base: PathBuf,
    pub host: HostPlatform,
    /// Hook failures and file conflicts become warnings
    pub force: bool,
    /// Remove an existing repository lock unconditionally
    pub force_lock: bool,
    pub assume_yes: bool,
    pub debug: bool,
    /// Running with an effective uid of 0
    pub privileged: bool,
    pub passphrase: Option<String>,
    pub report_url: Option<String>,
}

impl Session {
    pub fn new(root: impl Into<PathBuf>, base: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base: base.into(),
            host: HostPlatform::detect(),
            force: false,
            force_lock: false,
            assume_yes: false,
            debug: false,
            privileged: is_privileged(),
            passphrase: None,
            report_url: None,
        }
    }

    pub fn with_host(mut self, host: HostPlatform) -> Self {
        self.host = host;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.base.join(DB_FILE)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.base.join("lock")
    }

    /// Archived copies of installed packages
    pub fn installed_dir(&self) -> PathBuf {
        self.base.join("installed")
    }

    /// Cached removal hooks of one installed package
    pub fn metadata_dir(&self, name: &str) -> PathBuf {
        self.base.join("metadata").join(name)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base.join("downloads")
    }

    pub fn externals_dir(&self) -> PathBuf {
        self.base.join("externals")
    }

    /// Map a package path onto the install root
    pub fn root_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Inverse of [`Session::root_path`]; `None` for paths outside the root
    pub fn package_path(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|relative| format!("/{}", relative.to_string_lossy()))
    }

    /// Create the state directory layout
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.base.clone(),
            self.installed_dir(),
            self.base.join("metadata"),
            self.downloads_dir(),
            self.externals_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT, DEFAULT_BASE)
    }
}

fn is_privileged() -> bool {
    #[cfg(unix)]
    return nix::unistd::geteuid().is_root();

    #[cfg(not(unix))]
    return false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_derived_paths() {
        let session = Session::new("/mnt/target", "/srv/state");
        assert_eq!(session.db_path(), PathBuf::from("/srv/state/hostpkg.db"));
        assert_eq!(session.lock_dir(), PathBuf::from("/srv/state/lock"));
        assert_eq!(session.metadata_dir("nginx"), PathBuf::from("/srv/state/metadata/nginx"));
        assert_eq!(session.root_path("/etc/app.conf"), PathBuf::from("/mnt/target/etc/app.conf"));
        assert_eq!(session.root_path("etc/app.conf"), PathBuf::from("/mnt/target/etc/app.conf"));
        assert_eq!(
            session.package_path(Path::new("/mnt/target/etc/app.conf")).as_deref(),
            Some("/etc/app.conf")
        );
        assert!(session.package_path(Path::new("/etc/app.conf")).is_none());
    }

    #[test]
    fn test_ensure_dirs() {
        let temp = TempDir::new().unwrap();
        let session = Session::new(temp.path().join("root"), temp.path().join("base"));
        session.ensure_dirs().unwrap();
        assert!(session.installed_dir().is_dir());
        assert!(session.externals_dir().is_dir());
    }
}
