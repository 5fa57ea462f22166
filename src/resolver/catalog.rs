// src/resolver/catalog.rs

//! Per-name candidate lists, filtered against every requirement seen so far

use crate::error::Result;
use crate::packages::requirement::Requirement;
use crate::platform::HostPlatform;
use crate::resolver::candidate::{preference, Candidate};
use std::collections::BTreeMap;
use tracing::debug;

/// Supplies every known candidate for a requirement's name and kind
pub trait CandidateSource {
    fn candidates(&self, requirement: &Requirement) -> Result<Vec<Candidate>>;
}

/// Ranked candidates for one name.
///
/// When the best candidate is not installed a sentinel occupies depth 0, so
/// that every real pick which changes the host costs at least one depth unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub sentinel: bool,
    pub candidates: Vec<Candidate>,
}

impl CatalogEntry {
    fn rank(&mut self) {
        self.candidates.sort_by(preference);
        self.sentinel = self
            .candidates
            .first()
            .is_some_and(|best| !best.is_installed());
    }

    /// Smallest and largest depth of a real candidate
    pub fn depth_bounds(&self) -> Option<(usize, usize)> {
        if self.candidates.is_empty() {
            return None;
        }
        let offset = usize::from(self.sentinel);
        Some((offset, self.candidates.len() - 1 + offset))
    }

    /// The candidate at `depth`; `None` for the sentinel or out of range
    pub fn at_depth(&self, depth: usize) -> Option<&Candidate> {
        if self.sentinel {
            depth.checked_sub(1).and_then(|i| self.candidates.get(i))
        } else {
            self.candidates.get(depth)
        }
    }
}

/// Mapping from package name to its ranked candidates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Populate or narrow the entries for every requirement, then re-rank.
    ///
    /// Returns the first name left without candidates, if any.
    pub fn apply<S: CandidateSource + ?Sized>(
        &mut self,
        requirements: &[Requirement],
        source: &S,
        host: &HostPlatform,
    ) -> Result<Option<String>> {
        for req in requirements {
            match self.entries.get_mut(&req.name) {
                Some(entry) => entry.candidates.retain(|c| c.meets(req, host)),
                None => {
                    let candidates = source
                        .candidates(req)?
                        .into_iter()
                        .filter(|c| c.meets(req, host))
                        .collect();
                    self.entries.insert(
                        req.name.clone(),
                        CatalogEntry {
                            sentinel: false,
                            candidates,
                        },
                    );
                }
            }
        }

        for (name, entry) in self.entries.iter_mut() {
            if entry.candidates.is_empty() {
                debug!("No candidates left for {}", name);
                return Ok(Some(name.clone()));
            }
            entry.rank();
        }

        Ok(None)
    }
}
