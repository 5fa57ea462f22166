// src/resolver/mod.rs

//! Dependency resolution
//!
//! Candidates are concrete package options gathered from the installed-state
//! store, managed sources and the native package manager. The catalog narrows
//! and ranks them per name; the solver searches ranked combinations for the
//! least disruptive consistent set.

pub mod candidate;
pub mod catalog;
pub mod solver;

pub use candidate::{preference, Candidate, Origin};
pub use catalog::{CandidateSource, Catalog, CatalogEntry};
pub use solver::{DepthCombinations, Solution, Solver, MAX_COMBINATIONS_CHECKED};
