// src/resolver/candidate.rs

//! Candidates: concrete package options for a name, and how they are judged

use crate::packages::metadata::Metadata;
use crate::packages::requirement::Requirement;
use crate::platform::HostPlatform;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Specificity assigned to an empty OS/architecture list, which matches anything
const WILDCARD_SPECIFICITY: usize = usize::MAX;

/// Where a candidate comes from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    InstalledManaged,
    InstalledNative,
    /// Archive path, pre-seeded directory, or source URL
    AvailableManaged { location: String },
    AvailableNative,
}

impl Origin {
    pub fn is_installed(&self) -> bool {
        matches!(self, Origin::InstalledManaged | Origin::InstalledNative)
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Origin::InstalledNative | Origin::AvailableNative)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::InstalledManaged => write!(f, "installed"),
            Origin::InstalledNative => write!(f, "installed (native)"),
            Origin::AvailableManaged { location } => write!(f, "{}", location),
            Origin::AvailableNative => write!(f, "native"),
        }
    }
}

/// One concrete option for a package name
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub metadata: Arc<Metadata>,
    pub origin: Origin,
    /// Explicit preference; set on installed packages the operation should keep
    pub preferred: bool,
}

impl Candidate {
    pub fn new(metadata: impl Into<Arc<Metadata>>, origin: Origin) -> Self {
        Self {
            metadata: metadata.into(),
            origin,
            preferred: false,
        }
    }

    pub fn preferred(mut self, preferred: bool) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_installed(&self) -> bool {
        self.origin.is_installed()
    }

    /// Whether this candidate satisfies `req` on `host`
    pub fn meets(&self, req: &Requirement, host: &HostPlatform) -> bool {
        if req.is_native() != self.origin.is_native() {
            return false;
        }

        let meta = &self.metadata;
        if meta.name != req.name {
            return false;
        }

        if let Some(min) = &req.min_version {
            if meta.version < *min {
                return false;
            }
            if meta.version == *min {
                if let Some(min_pv) = &req.min_package_version {
                    match &meta.package_version {
                        Some(pv) if pv >= min_pv => {}
                        _ => return false,
                    }
                }
            }
        }

        if let Some(max) = &req.max_version {
            if meta.version > *max {
                return false;
            }
            if meta.version == *max {
                if let Some(max_pv) = &req.max_package_version {
                    match &meta.package_version {
                        Some(pv) if pv <= max_pv => {}
                        _ => return false,
                    }
                }
            }
        }

        host.matches_os(&meta.operating_systems) && host.matches_arch(&meta.architectures)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.metadata.label(), self.origin)
    }
}

fn specificity(count: usize) -> usize {
    if count == 0 { WILDCARD_SPECIFICITY } else { count }
}

/// Best-first ordering of candidates sharing a name.
///
/// Preferred before not preferred, then newer version, newer package version,
/// fewer operating systems, fewer architectures (empty lists last), installed
/// before not installed. Remaining ties fall back to the origin so the order
/// is total.
pub fn preference(a: &Candidate, b: &Candidate) -> Ordering {
    let (ma, mb) = (&a.metadata, &b.metadata);

    b.preferred
        .cmp(&a.preferred)
        .then_with(|| mb.version.cmp(&ma.version))
        .then_with(|| mb.package_version.cmp(&ma.package_version))
        .then_with(|| {
            specificity(ma.operating_systems.len()).cmp(&specificity(mb.operating_systems.len()))
        })
        .then_with(|| {
            specificity(ma.architectures.len()).cmp(&specificity(mb.architectures.len()))
        })
        .then_with(|| b.is_installed().cmp(&a.is_installed()))
        .then_with(|| a.origin.cmp(&b.origin))
}
