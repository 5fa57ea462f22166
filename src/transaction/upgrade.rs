// src/transaction/upgrade.rs

use super::apply::{dependencies_applied, shared_externals};
use super::{ApplyQueue, ApplySummary, Outcome, PackageIndex, TransactionEngine, TransactionState};
use crate::error::Result;
use crate::packages::metadata::{External, Metadata};
use crate::packages::requirement::Requirement;
use crate::packages::traits::UnpackOptions;
use crate::resolver::{Candidate, Origin, Solution};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

impl TransactionEngine<'_> {
    /// Move packages to their best available version; `None` upgrades every
    /// installed package. With `downgrade`, older versions may be chosen.
    pub fn upgrade(&self, requests: Option<&[String]>, downgrade: bool) -> Result<Outcome> {
        self.run("upgrade", || self.upgrade_locked(requests, downgrade))
    }

    fn upgrade_locked(&self, requests: Option<&[String]>, downgrade: bool) -> Result<Outcome> {
        let installed = self.parts.store.list_installed()?;
        let mut index = self.package_index(&installed)?;

        let mut requirements = match requests {
            Some(requests) => {
                let requirements = self.build_requirements(requests, &mut index)?;
                self.check_requests(&requirements, &index)?;
                requirements
            }
            None => installed
                .iter()
                .map(|metadata| Requirement::named(metadata.name.clone()))
                .collect(),
        };

        let core: BTreeSet<String> = requirements.iter().map(|r| r.name.clone()).collect();
        for name in &core {
            index.demote(name.clone());
        }

        if !downgrade {
            for name in &core {
                if let Some(current) = index.installed(name) {
                    requirements.push(Requirement::at_least(
                        name.clone(),
                        current.version.clone(),
                        current.package_version.clone(),
                    ));
                }
            }
        }

        requirements.extend(protect_dependents(&installed, &core));
        self.transition(TransactionState::RequirementsBuilt);

        let solution = self.solve(&index, &requirements, &core)?;
        self.transition(TransactionState::Solved);

        self.check_conflicts(&solution, &installed)?;
        self.transition(TransactionState::ConflictChecked);

        let pending: Vec<&Candidate> = solution.iter().filter(|c| !c.is_installed()).collect();
        if pending.is_empty() {
            info!("No updates available");
            return Ok(Outcome::NothingToDo);
        }
        if !self.confirm("upgraded", &pending)? {
            return Ok(Outcome::Aborted);
        }
        self.transition(TransactionState::Confirmed);

        self.transition(TransactionState::Applying);
        let summary = self.apply_solution(&solution, &index)?;
        Ok(Outcome::Applied(summary))
    }

    /// Unpack every pending member of `solution`. An installed package with
    /// a pending replacement is removed first and its replacement waits for
    /// `can_unpack`.
    pub(super) fn apply_solution(
        &self,
        solution: &Solution,
        index: &PackageIndex<'_>,
    ) -> Result<ApplySummary> {
        let pending: Vec<&Candidate> = solution.iter().filter(|c| !c.is_installed()).collect();
        let replacing: HashSet<&str> = pending
            .iter()
            .filter(|c| index.installed(c.name()).is_some())
            .map(|c| c.name())
            .collect();

        // Packages being replaced count as applied only once their new
        // version is in
        let mut applied: HashSet<String> = index
            .installed
            .iter()
            .map(|m| m.name.clone())
            .filter(|name| !replacing.contains(name.as_str()))
            .collect();
        applied.extend(
            solution
                .iter()
                .filter(|c| c.is_installed())
                .map(|c| c.name().to_string()),
        );

        let mut summary = ApplySummary::default();
        let mut skipped: HashMap<String, Vec<External>> = HashMap::new();
        let mut queue = ApplyQueue::new(pending.iter().copied());

        while let Some(candidate) = queue.pop() {
            if !dependencies_applied(candidate, &applied) {
                queue.defer(candidate).map_err(|e| summary.fail(e))?;
                continue;
            }

            let name = candidate.name();
            let managed = matches!(candidate.origin, Origin::AvailableManaged { .. });
            let old = index.installed(name);

            if managed && !skipped.contains_key(name) {
                let keep = match old {
                    Some(old) => {
                        let keep = shared_externals(old, &candidate.metadata);
                        self.remove_packages(std::slice::from_ref(old), &keep, &mut summary)?;
                        keep
                    }
                    None => Vec::new(),
                };
                skipped.insert(name.to_string(), keep);
            }

            if managed && !self.can_unpack(candidate, &applied).map_err(|e| summary.fail(e))? {
                queue.defer(candidate).map_err(|e| summary.fail(e))?;
                continue;
            }

            let options = UnpackOptions {
                passphrase: self.session.passphrase.clone(),
                externals_to_skip: skipped.get(name).cloned().unwrap_or_default(),
                upgrading: old.is_some(),
            };
            let changed = self
                .dispatch(candidate, &options)
                .map_err(|e| summary.fail(e))?;
            if changed {
                summary.installed.push(candidate.metadata.label());
            }
            applied.insert(name.to_string());
            queue.progressed();
        }

        Ok(summary)
    }

    /// The new version may only be unpacked once every managed dependency
    /// is installed at a version that satisfies it
    fn can_unpack(&self, candidate: &Candidate, applied: &HashSet<String>) -> Result<bool> {
        let host = &self.session.host;
        let on_host = self.parts.store.list_installed()?;

        for dependency in &candidate.metadata.dependencies {
            if dependency.is_native() {
                if !applied.contains(&dependency.name) {
                    return Ok(false);
                }
                continue;
            }
            let met = on_host.iter().any(|metadata| {
                Candidate::new(metadata.clone(), Origin::InstalledManaged).meets(dependency, host)
            });
            if !met {
                debug!("{} waits for {}", candidate.metadata.label(), dependency);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Every dependency of installed packages that depend on something being
/// upgraded, so the upgrade cannot break them
fn protect_dependents(installed: &[Metadata], scope: &BTreeSet<String>) -> Vec<Requirement> {
    installed
        .iter()
        .filter(|metadata| !scope.contains(&metadata.name))
        .filter(|metadata| {
            metadata
                .dependencies
                .iter()
                .any(|dependency| scope.contains(&dependency.name))
        })
        .flat_map(|metadata| {
            debug!("Protecting dependencies of {}", metadata.label());
            metadata.dependencies.iter().cloned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::meta;

    #[test]
    fn test_protect_dependents() {
        let mut app = meta("app", "1.0");
        app.dependencies = vec![
            Requirement::at_least("lib", crate::version::Version::parse("1.0").unwrap(), None),
            Requirement::named("base"),
        ];
        let lib = meta("lib", "1.0");
        let tool = meta("tool", "1.0");

        let scope: BTreeSet<String> = ["lib".to_string()].into();
        let extra = protect_dependents(&[app.clone(), lib, tool], &scope);
        assert_eq!(extra, app.dependencies);

        let scope: BTreeSet<String> = ["tool".to_string()].into();
        assert!(protect_dependents(&[app], &scope).is_empty());
    }
}
