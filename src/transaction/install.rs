// src/transaction/install.rs

use super::{Outcome, TransactionEngine, TransactionState};
use crate::error::Result;
use crate::packages::requirement::Requirement;
use crate::resolver::Candidate;
use std::collections::BTreeSet;
use tracing::info;

impl TransactionEngine<'_> {
    /// Install the requested packages and whatever they depend on.
    ///
    /// Requests are `name`, `name=version`, `name=version=packageVersion`,
    /// an archive path or an archive URL. Installed packages are never
    /// downgraded by an install. A dependency that needs a newer version of
    /// an installed package replaces it the way an upgrade does.
    pub fn install(&self, requests: &[String]) -> Result<Outcome> {
        self.run("install", || self.install_locked(requests))
    }

    fn install_locked(&self, requests: &[String]) -> Result<Outcome> {
        let installed = self.parts.store.list_installed()?;
        let mut index = self.package_index(&installed)?;

        let mut requirements = self.build_requirements(requests, &mut index)?;
        self.check_requests(&requirements, &index)?;

        let core: BTreeSet<String> = requirements.iter().map(|r| r.name.clone()).collect();
        for name in &core {
            if let Some(current) = index.installed(name) {
                requirements.push(Requirement::at_least(
                    name.clone(),
                    current.version.clone(),
                    current.package_version.clone(),
                ));
            }
        }
        self.transition(TransactionState::RequirementsBuilt);

        let solution = self.solve(&index, &requirements, &core)?;
        self.transition(TransactionState::Solved);

        self.check_conflicts(&solution, &installed)?;
        self.transition(TransactionState::ConflictChecked);

        let pending: Vec<&Candidate> = solution.iter().filter(|c| !c.is_installed()).collect();
        if pending.is_empty() {
            info!("All requested packages are already installed");
            return Ok(Outcome::NothingToDo);
        }
        if !self.confirm("installed", &pending)? {
            return Ok(Outcome::Aborted);
        }
        self.transition(TransactionState::Confirmed);

        self.transition(TransactionState::Applying);
        let summary = self.apply_solution(&solution, &index)?;
        Ok(Outcome::Applied(summary))
    }
}
