// src/transaction/remove.rs

use super::{ApplySummary, Outcome, TransactionEngine, TransactionState};
use crate::error::{Error, Result};
use crate::packages::archive::file_sha256;
use crate::packages::metadata::{External, Manifest, Metadata};
use crate::packages::requirement::Requirement;
use crate::resolver::{Candidate, Origin};
use crate::scripts::{self, ExternalOperation};
use crate::services;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use tracing::{debug, info, warn};

impl TransactionEngine<'_> {
    /// Remove installed managed packages; `None` removes everything.
    ///
    /// Fails with a conflict when another installed package depends on a
    /// package being removed.
    pub fn remove(&self, requests: Option<&[String]>) -> Result<Outcome> {
        self.run("remove", || self.remove_locked(requests))
    }

    fn remove_locked(&self, requests: Option<&[String]>) -> Result<Outcome> {
        let installed = self.parts.store.list_installed()?;
        let targets = self.removal_targets(requests, &installed)?;
        if targets.is_empty() {
            info!("Nothing to remove");
            return Ok(Outcome::NothingToDo);
        }
        self.transition(TransactionState::RequirementsBuilt);

        self.check_orphans(&targets, &installed)?;
        self.transition(TransactionState::ConflictChecked);

        let candidates: Vec<Candidate> = targets
            .iter()
            .map(|metadata| Candidate::new(metadata.clone(), Origin::InstalledManaged))
            .collect();
        let listed: Vec<&Candidate> = candidates.iter().collect();
        if !self.confirm("removed", &listed)? {
            return Ok(Outcome::Aborted);
        }
        self.transition(TransactionState::Confirmed);

        let stopping: Vec<&Metadata> = targets.iter().collect();
        services::stop_services(self.session, &stopping);

        self.transition(TransactionState::Applying);
        let mut summary = ApplySummary::default();
        self.remove_packages(&targets, &[], &mut summary)?;
        Ok(Outcome::Applied(summary))
    }

    fn removal_targets(&self, requests: Option<&[String]>, installed: &[Metadata]) -> Result<Vec<Metadata>> {
        let Some(requests) = requests else {
            return Ok(installed.to_vec());
        };

        let mut names = BTreeSet::new();
        for request in requests {
            let requirement = Requirement::parse(request)?;
            let matched: Vec<&Metadata> = installed
                .iter()
                .filter(|metadata| {
                    Candidate::new((*metadata).clone(), Origin::InstalledManaged)
                        .meets(&requirement, &self.session.host)
                })
                .collect();
            if matched.is_empty() {
                warn!("{} is not installed", requirement);
            }
            names.extend(matched.into_iter().map(|metadata| metadata.name.clone()));
        }

        Ok(installed
            .iter()
            .filter(|metadata| names.contains(&metadata.name))
            .cloned()
            .collect())
    }

    /// No remaining package may depend on a removed one
    fn check_orphans(&self, targets: &[Metadata], installed: &[Metadata]) -> Result<()> {
        let removing: BTreeSet<&str> = targets.iter().map(|m| m.name.as_str()).collect();
        for remaining in installed.iter().filter(|m| !removing.contains(m.name.as_str())) {
            for dependency in &remaining.dependencies {
                if !dependency.is_native() && removing.contains(dependency.name.as_str()) {
                    return Err(Error::ConflictDetected(format!(
                        "{} requires {}, which would be removed",
                        remaining.label(),
                        dependency
                    )));
                }
            }
        }
        Ok(())
    }

    /// Remove packages one by one. Reentrant: upgrades call this with the
    /// lock already held and the externals the new version keeps.
    pub(super) fn remove_packages(
        &self,
        targets: &[Metadata],
        externals_to_skip: &[External],
        summary: &mut ApplySummary,
    ) -> Result<()> {
        let _guard = self.lock.acquire()?;
        for metadata in targets {
            self.remove_one(metadata, externals_to_skip)
                .map_err(|e| summary.fail(e))?;
            summary.removed.push(metadata.label());
        }
        Ok(())
    }

    fn remove_one(&self, metadata: &Metadata, externals_to_skip: &[External]) -> Result<()> {
        info!("Removing {}", metadata.label());
        let cache = self.session.metadata_dir(&metadata.name);

        let preremove = cache.join("preremove");
        if preremove.is_file() {
            scripts::run_pre_hook(&preremove, self.session.force)?;
        }

        services::unwire(self.session, metadata)?;

        let filename = metadata.filename();
        for external in &metadata.externals {
            if externals_to_skip.contains(external) {
                debug!("Keeping external {} for the next version", external.name);
                continue;
            }
            scripts::run_external(
                &self.session.externals_dir(),
                external,
                &filename,
                ExternalOperation::Remove,
            );
        }

        let manifest = self.parts.store.manifest(&metadata.name)?;
        self.remove_files(&manifest)?;

        let postremove = cache.join("postremove");
        if postremove.is_file() {
            scripts::run_post_hook(&postremove);
        }

        let archived = self.session.installed_dir().join(&filename);
        match fs::remove_file(&archived) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No archived copy at {}", archived.display());
            }
            Err(e) => return Err(e.into()),
        }
        if cache.exists() {
            fs::remove_dir_all(&cache)?;
        }

        self.parts.store.forget_installed(&metadata.name)
    }

    /// Delete manifest entries, deepest paths first
    fn remove_files(&self, manifest: &Manifest) -> Result<()> {
        let mut entries: Vec<_> = manifest.files.iter().collect();
        entries.sort_by(|a, b| b.path.cmp(&a.path));

        for entry in entries {
            let path = self.session.root_path(&entry.path);

            if entry.directory {
                match fs::remove_dir(&path) {
                    Ok(()) => debug!("Removed directory {}", path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
                        debug!("Keeping non-empty directory {}", path.display());
                    }
                    Err(e) => warn!("Failed to remove directory {}: {}", path.display(), e),
                }
                continue;
            }

            let on_disk = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("{} is already gone", path.display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if entry.config && on_disk.is_file() && !entry.sha256.is_empty() {
                let current = file_sha256(&path)?;
                if current != entry.sha256 {
                    warn!("Keeping modified config file {}", path.display());
                    continue;
                }
            }

            fs::remove_file(&path).map_err(|e| {
                Error::IoError(format!("Failed to remove {}: {}", path.display(), e))
            })?;
            debug!("Removed {}", path.display());
        }
        Ok(())
    }
}
