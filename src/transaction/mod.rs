// src/transaction/mod.rs

//! Install, upgrade and remove transactions
//!
//! Every mutating operation runs under the repository lock and walks the
//! same states: requirements are built, solved, checked for conflicts and
//! confirmed before anything on the host changes. Failures after the first
//! change are not rolled back; they are reported with the list of packages
//! already applied.

mod apply;
mod install;
mod remove;
mod upgrade;

pub use apply::ApplyQueue;

use crate::error::{Error, Result};
use crate::lock::RepositoryLock;
use crate::native::NativePackageManager;
use crate::packages::metadata::Metadata;
use crate::packages::requirement::Requirement;
use crate::packages::traits::{
    ArchiveReader, AvailableIndex, Confirm, Fetcher, InstalledStore, Reporter, Unpacker,
};
use crate::repository::is_remote;
use crate::resolver::{Candidate, CandidateSource, Origin, Solution, Solver};
use crate::session::Session;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an operation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Locked,
    RequirementsBuilt,
    Solved,
    ConflictChecked,
    Confirmed,
    Applying,
    Done,
    Aborted,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::Locked => "locked",
            TransactionState::RequirementsBuilt => "requirements built",
            TransactionState::Solved => "solved",
            TransactionState::ConflictChecked => "conflict checked",
            TransactionState::Confirmed => "confirmed",
            TransactionState::Applying => "applying",
            TransactionState::Done => "done",
            TransactionState::Aborted => "aborted",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What an operation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Labels of packages installed (including new versions of upgrades)
    pub installed: Vec<String>,
    /// Labels of packages removed (including old versions of upgrades)
    pub removed: Vec<String>,
}

impl ApplySummary {
    fn applied(&self) -> Vec<String> {
        self.removed
            .iter()
            .map(|label| format!("-{}", label))
            .chain(self.installed.iter().map(|label| format!("+{}", label)))
            .collect()
    }

    /// Wrap an apply-phase error with what had already been applied
    fn fail(&self, error: Error) -> Error {
        if self.installed.is_empty() && self.removed.is_empty() {
            error
        } else {
            Error::PartialApply {
                applied: self.applied(),
                source: Box::new(error),
            }
        }
    }
}

/// Result of a mutating operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied(ApplySummary),
    /// The host already satisfies the request
    NothingToDo,
    /// The operator declined the confirmation
    Aborted,
}

/// One user request: a requirement on the catalog or a specific archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Requirement(Requirement),
    /// Local archive path or URL
    Archive(String),
}

impl Request {
    pub fn parse(request: &str) -> Result<Self> {
        let request = request.trim();
        if is_remote(request)
            || request.contains('/')
            || request.ends_with(&format!(".{}", crate::packages::metadata::ARCHIVE_EXTENSION))
        {
            return Ok(Request::Archive(request.to_string()));
        }
        Ok(Request::Requirement(Requirement::parse(request)?))
    }
}

/// The collaborators a transaction drives
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub store: &'a dyn InstalledStore,
    pub index: &'a dyn AvailableIndex,
    pub reader: &'a dyn ArchiveReader,
    pub unpacker: &'a dyn Unpacker,
    pub native: &'a dyn NativePackageManager,
    pub fetcher: &'a dyn Fetcher,
    pub reporter: Option<&'a dyn Reporter>,
    pub confirm: &'a dyn Confirm,
}

/// Candidates from the installed store, configured sources and the native
/// package manager, as seen by one operation
pub struct PackageIndex<'a> {
    installed: Vec<Arc<Metadata>>,
    available: Vec<(Arc<Metadata>, String)>,
    native: &'a dyn NativePackageManager,
    /// Names requested as a specific archive; no alternatives are offered
    pinned: BTreeMap<String, Candidate>,
    /// Names whose installed version gets no preference
    demoted: BTreeSet<String>,
}

impl<'a> PackageIndex<'a> {
    pub fn new(
        installed: &[Metadata],
        available: impl IntoIterator<Item = (Metadata, String)>,
        native: &'a dyn NativePackageManager,
    ) -> Self {
        Self {
            installed: installed.iter().cloned().map(Arc::new).collect(),
            available: available
                .into_iter()
                .map(|(metadata, location)| (Arc::new(metadata), location))
                .collect(),
            native,
            pinned: BTreeMap::new(),
            demoted: BTreeSet::new(),
        }
    }

    pub fn pin(&mut self, candidate: Candidate) {
        self.pinned.insert(candidate.name().to_string(), candidate);
    }

    pub fn demote(&mut self, name: impl Into<String>) {
        self.demoted.insert(name.into());
    }

    pub fn installed(&self, name: &str) -> Option<&Metadata> {
        self.installed
            .iter()
            .find(|metadata| metadata.name == name)
            .map(|metadata| metadata.as_ref())
    }
}

impl CandidateSource for PackageIndex<'_> {
    fn candidates(&self, requirement: &Requirement) -> Result<Vec<Candidate>> {
        let name = requirement.name.as_str();
        let preferred = !self.demoted.contains(name);

        if requirement.is_native() {
            let mut candidates: Vec<Candidate> = self
                .native
                .installed(name)?
                .into_iter()
                .map(|candidate| candidate.preferred(preferred))
                .collect();
            candidates.extend(self.native.available(name)?);
            return Ok(candidates);
        }

        if let Some(pinned) = self.pinned.get(name) {
            return Ok(vec![pinned.clone()]);
        }

        let installed = self
            .installed
            .iter()
            .filter(|metadata| metadata.name == name)
            .map(|metadata| {
                Candidate::new(Arc::clone(metadata), Origin::InstalledManaged).preferred(preferred)
            });
        let available = self
            .available
            .iter()
            .filter(|(metadata, _)| metadata.name == name)
            .map(|(metadata, location)| {
                Candidate::new(
                    Arc::clone(metadata),
                    Origin::AvailableManaged {
                        location: location.clone(),
                    },
                )
            });

        Ok(installed.chain(available).collect())
    }
}

/// Asks on the terminal; declines when stdin is not a terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompter;

impl Confirm for TerminalPrompter {
    fn confirm(&self, action: &str, items: &[String]) -> Result<bool> {
        println!("The following packages will be {}:", action);
        for item in items {
            println!("  {}", item);
        }

        if !std::io::stdin().is_terminal() {
            warn!("Not running on a terminal; pass --yes to proceed without confirmation");
            return Ok(false);
        }

        dialoguer::Confirm::new()
            .with_prompt("Proceed?")
            .default(false)
            .interact()
            .map_err(|e| Error::IoError(format!("Prompt error: {}", e)))
    }
}

/// Runs install, upgrade and remove transactions against one host
pub struct TransactionEngine<'a> {
    session: &'a Session,
    lock: RepositoryLock,
    parts: Collaborators<'a>,
    state: Cell<TransactionState>,
}

impl<'a> TransactionEngine<'a> {
    pub fn new(session: &'a Session, parts: Collaborators<'a>) -> Self {
        Self {
            session,
            lock: RepositoryLock::new(session.lock_dir(), session.force_lock),
            parts,
            state: Cell::new(TransactionState::Idle),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn lock(&self) -> &RepositoryLock {
        &self.lock
    }

    fn transition(&self, next: TransactionState) {
        debug!("Transaction {} -> {}", self.state.get(), next);
        self.state.set(next);
    }

    /// Run `operation` under the repository lock, recording how it ended
    fn run<F>(&self, operation: &str, body: F) -> Result<Outcome>
    where
        F: FnOnce() -> Result<Outcome>,
    {
        self.transition(TransactionState::Idle);
        let guard = self.lock.acquire()?;
        self.transition(TransactionState::Locked);
        debug!("Starting {}", operation);

        let result = body();
        drop(guard);

        match &result {
            Ok(Outcome::Aborted) => self.transition(TransactionState::Aborted),
            Ok(_) => self.transition(TransactionState::Done),
            Err(e) => {
                debug!("{} failed: {}", operation, e);
                self.transition(TransactionState::Failed);
            }
        }
        result
    }

    fn package_index(&self, installed: &[Metadata]) -> Result<PackageIndex<'a>> {
        let available = self
            .parts
            .index
            .list_available()?
            .into_iter()
            .map(|package| (package.metadata, package.location));
        Ok(PackageIndex::new(installed, available, self.parts.native))
    }

    /// Turn requests into requirements, pinning archive requests in `index`
    fn build_requirements(
        &self,
        requests: &[String],
        index: &mut PackageIndex<'_>,
    ) -> Result<Vec<Requirement>> {
        let mut requirements = Vec::new();
        for request in requests {
            match Request::parse(request)? {
                Request::Requirement(requirement) => requirements.push(requirement),
                Request::Archive(location) => {
                    let path = self.local_archive(&location)?;
                    let metadata = self.parts.reader.read_metadata(&path)?;
                    requirements.push(Requirement::exact(
                        metadata.name.clone(),
                        metadata.version.clone(),
                        metadata.package_version.clone(),
                    ));
                    index.pin(Candidate::new(
                        metadata,
                        Origin::AvailableManaged {
                            location: path.to_string_lossy().into_owned(),
                        },
                    ));
                }
            }
        }
        Ok(requirements)
    }

    /// A requested archive as a local file, downloading URLs
    fn local_archive(&self, location: &str) -> Result<std::path::PathBuf> {
        if is_remote(location) {
            let (source, filename) = location
                .rsplit_once('/')
                .filter(|(_, filename)| !filename.is_empty())
                .ok_or_else(|| Error::ParseError(format!("No file name in URL {}", location)))?;
            return self.parts.fetcher.fetch(source, filename);
        }
        let path = Path::new(location);
        if !path.is_file() {
            return Err(Error::NotFoundError(format!("Package file {} not found", location)));
        }
        Ok(path.to_path_buf())
    }

    /// Fail fast on requests no candidate can satisfy, directly or through
    /// its immediate dependencies
    fn check_requests(&self, requirements: &[Requirement], index: &PackageIndex<'_>) -> Result<()> {
        let host = &self.session.host;
        for requirement in requirements {
            let matching: Vec<Candidate> = index
                .candidates(requirement)?
                .into_iter()
                .filter(|candidate| candidate.meets(requirement, host))
                .collect();
            if matching.is_empty() {
                return Err(Error::UnsatisfiableRequirement(format!(
                    "no package matches {} on {}",
                    requirement, host
                )));
            }

            let mut unmet = None;
            for candidate in &matching {
                match self.first_unmet_dependency(candidate, index)? {
                    None => {
                        unmet = None;
                        break;
                    }
                    Some(dependency) => unmet = Some(dependency),
                }
            }
            if let Some(dependency) = unmet {
                return Err(Error::UnsatisfiableRequirement(format!(
                    "{} requires {}, which no package provides",
                    requirement, dependency
                )));
            }
        }
        Ok(())
    }

    fn first_unmet_dependency(
        &self,
        candidate: &Candidate,
        index: &PackageIndex<'_>,
    ) -> Result<Option<Requirement>> {
        let host = &self.session.host;
        for dependency in &candidate.metadata.dependencies {
            let any = index
                .candidates(dependency)?
                .iter()
                .any(|c| c.meets(dependency, host));
            if !any {
                return Ok(Some(dependency.clone()));
            }
        }
        Ok(None)
    }

    fn solve(
        &self,
        index: &PackageIndex<'_>,
        requirements: &[Requirement],
        core: &BTreeSet<String>,
    ) -> Result<Solution> {
        let mut solver = Solver::new(index, &self.session.host);
        let solution = solver.best_solution(requirements, core)?;
        match solution {
            Some(solution) => {
                for candidate in &solution {
                    debug!("Solution member {}", candidate);
                }
                Ok(solution)
            }
            None => {
                let wanted: Vec<String> = requirements.iter().map(|r| r.to_string()).collect();
                Err(Error::UnresolvableDependencies(wanted.join(", ")))
            }
        }
    }

    /// Reject solutions whose members conflict with each other or with
    /// installed packages the solution leaves alone
    fn check_conflicts(&self, solution: &Solution, installed: &[Metadata]) -> Result<()> {
        let host = &self.session.host;
        let chosen: BTreeSet<&str> = solution.iter().map(Candidate::name).collect();
        let untouched: Vec<Candidate> = installed
            .iter()
            .filter(|metadata| !chosen.contains(metadata.name.as_str()))
            .map(|metadata| Candidate::new(metadata.clone(), Origin::InstalledManaged))
            .collect();

        let members: Vec<(&Candidate, bool)> = solution
            .iter()
            .map(|candidate| (candidate, true))
            .chain(untouched.iter().map(|candidate| (candidate, false)))
            .collect();

        for (a, a_chosen) in &members {
            for conflict in &a.metadata.conflicts {
                for (b, b_chosen) in &members {
                    if a.name() == b.name() || !(*a_chosen || *b_chosen) {
                        continue;
                    }
                    if b.meets(conflict, host) {
                        return Err(Error::ConflictDetected(format!(
                            "{} conflicts with {}",
                            a.metadata.label(),
                            b.metadata.label()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn confirm(&self, action: &str, candidates: &[&Candidate]) -> Result<bool> {
        if self.session.assume_yes {
            return Ok(true);
        }
        let items: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
        let approved = self.parts.confirm.confirm(action, &items)?;
        if !approved {
            info!("Operation cancelled");
        }
        Ok(approved)
    }

    fn report(&self, manifest: &crate::packages::metadata::Manifest) {
        if let Some(reporter) = self.parts.reporter {
            if let Err(e) = reporter.report(manifest) {
                warn!("Failed to report {}: {}", manifest.version, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::native::Unsupported;
    use crate::version::Version;

    pub(crate) fn meta(name: &str, version: &str) -> Metadata {
        Metadata::new(name, Version::parse(version).unwrap())
    }

    #[test]
    fn test_request_parse() {
        assert_eq!(
            Request::parse("nginx=1.2").unwrap(),
            Request::Requirement(Requirement::exact("nginx", Version::parse("1.2").unwrap(), None))
        );
        assert_eq!(
            Request::parse("/tmp/nginx-1.2.hpkg").unwrap(),
            Request::Archive("/tmp/nginx-1.2.hpkg".to_string())
        );
        assert_eq!(
            Request::parse("https://pkgs.example.com/nginx-1.2.hpkg").unwrap(),
            Request::Archive("https://pkgs.example.com/nginx-1.2.hpkg".to_string())
        );
        assert!(Request::parse("bad name!").is_err());
    }

    #[test]
    fn test_index_prefers_installed_unless_demoted() {
        let native = Unsupported;
        let mut index = PackageIndex::new(
            &[meta("app", "1.0")],
            vec![(meta("app", "2.0"), "/srv/pkgs".to_string())],
            &native,
        );

        let candidates = index.candidates(&Requirement::named("app")).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].is_installed() && candidates[0].preferred);
        assert!(!candidates[1].preferred);

        index.demote("app");
        let candidates = index.candidates(&Requirement::named("app")).unwrap();
        assert!(candidates.iter().all(|c| !c.preferred));
    }

    #[test]
    fn test_pinned_candidate_has_no_alternatives() {
        let native = Unsupported;
        let mut index = PackageIndex::new(
            &[meta("app", "1.0")],
            vec![(meta("app", "2.0"), "/srv/pkgs".to_string())],
            &native,
        );
        index.pin(Candidate::new(
            meta("app", "1.5"),
            Origin::AvailableManaged {
                location: "/tmp/app-1.5.hpkg".to_string(),
            },
        ));

        let candidates = index.candidates(&Requirement::named("app")).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].metadata.version.as_str(), "1.5");
    }

    #[test]
    fn test_partial_apply_summary() {
        let mut summary = ApplySummary::default();
        let err = summary.fail(Error::ConflictDetected("x".to_string()));
        assert!(matches!(err, Error::ConflictDetected(_)));

        summary.removed.push("app-1.0".to_string());
        summary.installed.push("app-2.0".to_string());
        match summary.fail(Error::ConflictDetected("x".to_string())) {
            Error::PartialApply { applied, .. } => {
                assert_eq!(applied, vec!["-app-1.0", "+app-2.0"]);
            }
            other => panic!("unexpected {}", other),
        }
    }
}
