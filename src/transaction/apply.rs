// src/transaction/apply.rs

//! Applying solution members to the host, in dependency order

use super::TransactionEngine;
use crate::error::{Error, Result};
use crate::packages::metadata::Metadata;
use crate::packages::traits::UnpackOptions;
use crate::repository::is_remote;
use crate::resolver::{Candidate, Origin};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Pending packages, applied once their dependencies are.
///
/// A package whose dependencies are not ready goes to the back of the
/// queue. When every pending package has been deferred since the last
/// progress, the remaining packages depend on each other.
pub struct ApplyQueue<'c> {
    pending: VecDeque<&'c Candidate>,
    stalled: usize,
}

impl<'c> ApplyQueue<'c> {
    pub fn new(candidates: impl IntoIterator<Item = &'c Candidate>) -> Self {
        Self {
            pending: candidates.into_iter().collect(),
            stalled: 0,
        }
    }

    pub fn pop(&mut self) -> Option<&'c Candidate> {
        self.pending.pop_front()
    }

    /// Requeue a package that cannot be applied yet
    pub fn defer(&mut self, candidate: &'c Candidate) -> Result<()> {
        debug!("Deferring {}", candidate.metadata.label());
        self.pending.push_back(candidate);
        self.stalled += 1;
        if self.stalled >= self.pending.len() {
            let mut names: Vec<String> = self
                .pending
                .iter()
                .map(|candidate| candidate.name().to_string())
                .collect();
            names.sort();
            return Err(Error::DependencyCycle(names));
        }
        Ok(())
    }

    /// Record that a package was applied
    pub fn progressed(&mut self) {
        self.stalled = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Whether every dependency of `candidate` names an applied package
pub(super) fn dependencies_applied(candidate: &Candidate, applied: &HashSet<String>) -> bool {
    candidate
        .metadata
        .dependencies
        .iter()
        .all(|dependency| applied.contains(&dependency.name))
}

/// Externals declared identically by both versions of a package
pub(super) fn shared_externals(old: &Metadata, new: &Metadata) -> Vec<crate::packages::metadata::External> {
    old.externals
        .iter()
        .filter(|external| new.externals.contains(external))
        .cloned()
        .collect()
}

impl TransactionEngine<'_> {
    /// Apply one solution member; returns whether the host changed
    pub(super) fn dispatch(&self, candidate: &Candidate, options: &UnpackOptions) -> Result<bool> {
        let metadata = &candidate.metadata;
        match &candidate.origin {
            Origin::InstalledManaged | Origin::InstalledNative => Ok(false),
            Origin::AvailableNative => {
                self.parts.native.install(
                    &metadata.name,
                    &metadata.version,
                    metadata.package_version.as_ref(),
                )?;
                Ok(true)
            }
            Origin::AvailableManaged { location } => self.install_managed(metadata, location, options),
        }
    }

    fn install_managed(&self, metadata: &Metadata, location: &str, options: &UnpackOptions) -> Result<bool> {
        let filename = metadata.filename();
        let archived = self.session.installed_dir().join(&filename);
        if archived.exists() {
            info!("{} is already installed", filename);
            return Ok(false);
        }

        let archive = self.resolve_archive(location, &filename)?;
        self.check_file_conflicts(&archive, metadata)?;

        let manifest = self.parts.unpacker.apply(&archive, options)?;
        self.parts.store.record_installed(metadata, &manifest)?;

        fs::create_dir_all(self.session.installed_dir())?;
        fs::copy(&archive, &archived).map_err(|e| {
            Error::IoError(format!("Failed to archive {}: {}", archive.display(), e))
        })?;

        info!("Installed {}", metadata.label());
        self.report(&manifest);
        Ok(true)
    }

    /// A local path for the archive: a direct file, or fetched from a
    /// local directory or remote source
    fn resolve_archive(&self, location: &str, filename: &str) -> Result<PathBuf> {
        if !is_remote(location) {
            let path = Path::new(location);
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
        }
        self.parts.fetcher.fetch(location, filename)
    }

    /// Refuse to overwrite files owned by other installed packages
    fn check_file_conflicts(&self, archive: &Path, metadata: &Metadata) -> Result<()> {
        let files: BTreeSet<String> = self.parts.reader.payload_files(archive)?.into_iter().collect();
        let conflicts: Vec<String> = self
            .parts
            .store
            .file_owners()?
            .into_iter()
            .filter(|(path, owner)| *owner != metadata.name && files.contains(path))
            .map(|(path, owner)| format!("{} (owned by {})", path, owner))
            .collect();

        if conflicts.is_empty() {
            return Ok(());
        }
        let message = format!("{} would overwrite {}", metadata.label(), conflicts.join(", "));
        if self.session.force {
            warn!("{} (continuing, forced)", message);
            Ok(())
        } else {
            Err(Error::ConflictDetected(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::requirement::Requirement;
    use crate::transaction::tests::meta;

    fn candidate(name: &str, deps: &[&str]) -> Candidate {
        let mut metadata = meta(name, "1.0");
        metadata.dependencies = deps.iter().map(|dep| Requirement::named(*dep)).collect();
        Candidate::new(
            metadata,
            Origin::AvailableManaged {
                location: "/srv".to_string(),
            },
        )
    }

    /// Drain the queue, applying whatever is ready
    fn drain(candidates: &[Candidate], seed: &[&str]) -> Result<Vec<String>> {
        let mut applied: HashSet<String> = seed.iter().map(|s| s.to_string()).collect();
        let mut order = Vec::new();
        let mut queue = ApplyQueue::new(candidates);
        while let Some(next) = queue.pop() {
            if !dependencies_applied(next, &applied) {
                queue.defer(next)?;
                continue;
            }
            applied.insert(next.name().to_string());
            order.push(next.name().to_string());
            queue.progressed();
        }
        assert!(queue.is_empty());
        Ok(order)
    }

    #[test]
    fn test_queue_orders_by_dependency() {
        let candidates = vec![
            candidate("app", &["lib", "base"]),
            candidate("lib", &["base"]),
            candidate("base", &[]),
        ];
        assert_eq!(drain(&candidates, &[]).unwrap(), vec!["base", "lib", "app"]);
    }

    #[test]
    fn test_queue_uses_seeded_names() {
        let candidates = vec![candidate("app", &["installed-lib"])];
        assert_eq!(drain(&candidates, &["installed-lib"]).unwrap(), vec!["app"]);
    }

    #[test]
    fn test_queue_detects_cycle() {
        let candidates = vec![
            candidate("a", &["b"]),
            candidate("b", &["a"]),
            candidate("c", &[]),
        ];
        match drain(&candidates, &[]).unwrap_err() {
            Error::DependencyCycle(names) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_shared_externals() {
        use crate::packages::metadata::External;
        let users = External {
            name: "users".to_string(),
            data: Some("alice".to_string()),
        };
        let mut old = meta("app", "1.0");
        let mut new = meta("app", "2.0");
        old.externals = vec![
            users.clone(),
            External {
                name: "cron".to_string(),
                data: None,
            },
        ];
        new.externals = vec![
            users.clone(),
            External {
                name: "users".to_string(),
                data: Some("bob".to_string()),
            },
        ];
        assert_eq!(shared_externals(&old, &new), vec![users]);
    }
}
