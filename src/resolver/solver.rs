// src/resolver/solver.rs

//! Enumerative dependency solver
//!
//! Combinations of candidates are visited in order of total depth, core
//! (requested) names first, so the first accepted solution disturbs the host
//! as little as possible. Dependencies of a combination that name packages not
//! yet part of it become new requirements, and the search recurses with the
//! extended requirement list.

use crate::error::{Error, Result};
use crate::packages::requirement::Requirement;
use crate::platform::HostPlatform;
use crate::resolver::candidate::Candidate;
use crate::resolver::catalog::{CandidateSource, Catalog};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Upper bound on combinations checked per resolution
pub const MAX_COMBINATIONS_CHECKED: usize = 10_000;

/// One candidate per name of the requirement closure, ordered by name
pub type Solution = Vec<Candidate>;

pub struct Solver<'a, S: CandidateSource + ?Sized> {
    source: &'a S,
    host: &'a HostPlatform,
    budget: usize,
    checked: usize,
}

impl<'a, S: CandidateSource + ?Sized> Solver<'a, S> {
    pub fn new(source: &'a S, host: &'a HostPlatform) -> Self {
        Self {
            source,
            host,
            budget: MAX_COMBINATIONS_CHECKED,
            checked: 0,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// Combinations checked so far
    pub fn checked(&self) -> usize {
        self.checked
    }

    /// Find the least disruptive solution for `requirements`.
    ///
    /// `Ok(None)` means the search space was exhausted without a solution;
    /// running out of budget is an error.
    pub fn best_solution(
        &mut self,
        requirements: &[Requirement],
        core: &BTreeSet<String>,
    ) -> Result<Option<Solution>> {
        let solution = self.solve(requirements.to_vec(), Catalog::new(), core)?;
        debug!(
            "Solver checked {} combination(s), solution {}",
            self.checked,
            if solution.is_some() { "found" } else { "not found" }
        );
        Ok(solution)
    }

    fn solve(
        &mut self,
        requirements: Vec<Requirement>,
        mut catalog: Catalog,
        core: &BTreeSet<String>,
    ) -> Result<Option<Solution>> {
        if let Some(name) = catalog.apply(&requirements, self.source, self.host)? {
            debug!("Branch has no candidates for {}", name);
            return Ok(None);
        }

        let names: BTreeSet<&str> = requirements.iter().map(|r| r.name.as_str()).collect();
        let (core_names, other_names): (Vec<&str>, Vec<&str>) =
            names.into_iter().partition(|name| core.contains(*name));

        let core_bounds = bounds(&catalog, &core_names);
        let other_bounds = bounds(&catalog, &other_names);

        let (core_min, core_max) = sum_bounds(&core_bounds);
        let (other_min, other_max) = sum_bounds(&other_bounds);

        for core_depth in core_min..=core_max {
            for core_combo in DepthCombinations::new(core_bounds.clone(), core_depth) {
                for other_depth in other_min..=other_max {
                    for other_combo in DepthCombinations::new(other_bounds.clone(), other_depth) {
                        self.checked += 1;
                        if self.checked > self.budget {
                            debug!("Solver budget of {} exhausted", self.budget);
                            return Err(Error::SolverBudgetExceeded(self.budget));
                        }

                        let assignment = core_names
                            .iter()
                            .copied()
                            .zip(core_combo.iter().copied())
                            .chain(other_names.iter().copied().zip(other_combo.iter().copied()));
                        let combination = pick(&catalog, assignment);
                        if let Some(solution) =
                            self.check_solution(combination, &requirements, &catalog, core)?
                        {
                            return Ok(Some(solution));
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    /// Accept the combination, reject it, or recurse on the dependencies it
    /// introduces
    fn check_solution(
        &mut self,
        combination: BTreeMap<String, Candidate>,
        requirements: &[Requirement],
        catalog: &Catalog,
        core: &BTreeSet<String>,
    ) -> Result<Option<Solution>> {
        let mut new_requirements = Vec::new();

        for candidate in combination.values() {
            for dep in &candidate.metadata.dependencies {
                match combination.get(&dep.name) {
                    Some(chosen) if chosen.meets(dep, self.host) => {}
                    Some(chosen) => {
                        debug!("{} does not satisfy {} for {}", chosen, dep, candidate);
                        return Ok(None);
                    }
                    None => new_requirements.push(dep.clone()),
                }
            }
        }

        if new_requirements.is_empty() {
            return Ok(Some(combination.into_values().collect()));
        }

        let mut extended = requirements.to_vec();
        extended.extend(new_requirements);
        self.solve(extended, catalog.clone(), core)
    }
}

fn bounds(catalog: &Catalog, names: &[&str]) -> Vec<(usize, usize)> {
    names
        .iter()
        .filter_map(|name| catalog.get(name).and_then(|entry| entry.depth_bounds()))
        .collect()
}

fn sum_bounds(bounds: &[(usize, usize)]) -> (usize, usize) {
    bounds
        .iter()
        .fold((0, 0), |(lo, hi), (min, max)| (lo + min, hi + max))
}

fn pick<'n>(
    catalog: &Catalog,
    assignment: impl Iterator<Item = (&'n str, usize)>,
) -> BTreeMap<String, Candidate> {
    assignment
        .filter_map(|(name, depth)| {
            catalog
                .get(name)
                .and_then(|entry| entry.at_depth(depth))
                .map(|c| (name.to_string(), c.clone()))
        })
        .collect()
}

/// Every assignment of depths within per-position bounds summing to a fixed
/// total, in lexicographic order
#[derive(Debug, Clone)]
pub struct DepthCombinations {
    bounds: Vec<(usize, usize)>,
    next: Option<Vec<usize>>,
}

impl DepthCombinations {
    pub fn new(bounds: Vec<(usize, usize)>, total: usize) -> Self {
        let mut depths: Vec<usize> = bounds.iter().map(|(min, _)| *min).collect();
        let floor: usize = depths.iter().sum();
        let next = total
            .checked_sub(floor)
            .and_then(|extra| fill_from_right(&bounds, &mut depths, 0, extra).then_some(depths));
        Self { bounds, next }
    }

    fn successor(&self, current: &[usize]) -> Option<Vec<usize>> {
        let n = current.len();
        let mut slack_right = 0;

        for i in (0..n.saturating_sub(1)).rev() {
            slack_right += current[i + 1] - self.bounds[i + 1].0;
            if current[i] < self.bounds[i].1 && slack_right > 0 {
                let mut depths = current.to_vec();
                depths[i] += 1;
                for (j, depth) in depths.iter_mut().enumerate().skip(i + 1) {
                    *depth = self.bounds[j].0;
                }
                if fill_from_right(&self.bounds, &mut depths, i + 1, slack_right - 1) {
                    return Some(depths);
                }
            }
        }
        None
    }
}

/// Distribute `extra` over positions `from..`, rightmost first
fn fill_from_right(
    bounds: &[(usize, usize)],
    depths: &mut [usize],
    from: usize,
    mut extra: usize,
) -> bool {
    for i in (from..depths.len()).rev() {
        let room = bounds[i].1 - depths[i];
        let add = room.min(extra);
        depths[i] += add;
        extra -= add;
    }
    extra == 0
}

impl Iterator for DepthCombinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;
        self.next = self.successor(&current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::metadata::Metadata;
    use crate::resolver::candidate::Origin;
    use crate::version::Version;

    struct Fixed(Vec<Candidate>);

    impl CandidateSource for Fixed {
        fn candidates(&self, req: &Requirement) -> Result<Vec<Candidate>> {
            Ok(self.0.iter().filter(|c| c.name() == req.name).cloned().collect())
        }
    }

    fn host() -> HostPlatform {
        HostPlatform::new("Ubuntu-22.04", "x86_64")
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn meta(name: &str, version: &str, deps: Vec<Requirement>) -> Metadata {
        let mut m = Metadata::new(name, v(version));
        m.dependencies = deps;
        m
    }

    fn avail(m: Metadata) -> Candidate {
        Candidate::new(
            m,
            Origin::AvailableManaged {
                location: "/srv".to_string(),
            },
        )
    }

    fn installed(m: Metadata) -> Candidate {
        Candidate::new(m, Origin::InstalledManaged).preferred(true)
    }

    fn core(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn labels(solution: &Solution) -> Vec<String> {
        solution.iter().map(|c| c.metadata.label()).collect()
    }

    #[test]
    fn test_depth_combinations_order() {
        let combos: Vec<_> = DepthCombinations::new(vec![(0, 2), (0, 2)], 2).collect();
        assert_eq!(combos, vec![vec![0, 2], vec![1, 1], vec![2, 0]]);
    }

    #[test]
    fn test_depth_combinations_respect_minimums() {
        let combos: Vec<_> = DepthCombinations::new(vec![(1, 2), (0, 1), (1, 3)], 3).collect();
        assert_eq!(combos, vec![vec![1, 0, 2], vec![1, 1, 1], vec![2, 0, 1]]);
        assert_eq!(DepthCombinations::new(vec![(1, 2)], 0).count(), 0);
        assert_eq!(DepthCombinations::new(vec![(0, 1), (0, 1)], 3).count(), 0);
    }

    #[test]
    fn test_depth_combinations_cover_every_assignment_once() {
        let bounds = vec![(0, 2), (1, 3), (0, 1)];
        let mut seen = BTreeSet::new();
        for total in 1..=6 {
            for combo in DepthCombinations::new(bounds.clone(), total) {
                assert_eq!(combo.iter().sum::<usize>(), total);
                assert!(seen.insert(combo));
            }
        }
        assert_eq!(seen.len(), 3 * 3 * 2);
    }

    #[test]
    fn test_empty_bounds_yield_single_empty_combination() {
        let combos: Vec<_> = DepthCombinations::new(vec![], 0).collect();
        assert_eq!(combos, vec![Vec::<usize>::new()]);
    }

    #[test]
    fn test_installed_dependency_kept() {
        let source = Fixed(vec![
            installed(meta("a", "1.0", vec![])),
            avail(meta("a", "1.1", vec![])),
            avail(meta("b", "2.0", vec![Requirement::at_least("a", v("1.0"), None)])),
        ]);
        let host = host();
        let mut solver = Solver::new(&source, &host);

        let solution = solver
            .best_solution(&[Requirement::named("b")], &core(&["b"]))
            .unwrap()
            .unwrap();

        assert_eq!(labels(&solution), vec!["a-1.0", "b-2.0"]);
        assert!(solution[0].is_installed());
    }

    #[test]
    fn test_picks_older_dependency_to_satisfy_bound() {
        let mut at_most = Requirement::named("lib");
        at_most.max_version = Some(v("1.5"));
        let source = Fixed(vec![
            avail(meta("app", "1.0", vec![at_most])),
            avail(meta("lib", "1.0", vec![])),
            avail(meta("lib", "2.0", vec![])),
        ]);
        let host = host();

        let solution = Solver::new(&source, &host)
            .best_solution(&[Requirement::named("app")], &core(&["app"]))
            .unwrap()
            .unwrap();
        assert_eq!(labels(&solution), vec!["app-1.0", "lib-1.0"]);
    }

    #[test]
    fn test_core_depth_preferred_over_dependency_depth() {
        // The newest app needs a lib newer than the installed one: the core
        // pick stays at depth 1 and the dependency moves instead
        let source = Fixed(vec![
            avail(meta("app", "2.0", vec![Requirement::at_least("lib", v("2.0"), None)])),
            avail(meta("app", "1.0", vec![Requirement::named("lib")])),
            installed(meta("lib", "1.0", vec![])),
            avail(meta("lib", "2.0", vec![])),
        ]);
        let host = host();

        let solution = Solver::new(&source, &host)
            .best_solution(&[Requirement::named("app")], &core(&["app"]))
            .unwrap()
            .unwrap();
        assert_eq!(labels(&solution), vec!["app-2.0", "lib-2.0"]);
    }

    #[test]
    fn test_conflicting_dependency_backtracks() {
        // b needs a exactly 1.0, so the newer a must be passed over
        let source = Fixed(vec![
            avail(meta("a", "2.0", vec![])),
            avail(meta("a", "1.0", vec![])),
            avail(meta("b", "1.0", vec![Requirement::exact("a", v("1.0"), None)])),
        ]);
        let host = host();
        let reqs = [Requirement::named("a"), Requirement::named("b")];

        let solution = Solver::new(&source, &host)
            .best_solution(&reqs, &core(&["a", "b"]))
            .unwrap()
            .unwrap();
        assert_eq!(labels(&solution), vec!["a-1.0", "b-1.0"]);
    }

    #[test]
    fn test_no_solution() {
        let source = Fixed(vec![avail(meta(
            "app",
            "1.0",
            vec![Requirement::at_least("lib", v("3.0"), None)],
        ))]);
        let host = host();

        let result = Solver::new(&source, &host)
            .best_solution(&[Requirement::named("app")], &core(&["app"]))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_transitive_closure() {
        let source = Fixed(vec![
            avail(meta("a", "1.0", vec![Requirement::named("b")])),
            avail(meta("b", "1.0", vec![Requirement::named("c")])),
            avail(meta("c", "1.0", vec![])),
        ]);
        let host = host();

        let solution = Solver::new(&source, &host)
            .best_solution(&[Requirement::named("a")], &core(&["a"]))
            .unwrap()
            .unwrap();
        assert_eq!(labels(&solution), vec!["a-1.0", "b-1.0", "c-1.0"]);
    }

    #[test]
    fn test_solver_is_deterministic() {
        let source = Fixed(vec![
            avail(meta("a", "1.0", vec![Requirement::named("c")])),
            avail(meta("b", "1.0", vec![Requirement::named("c")])),
            avail(meta("c", "1.0", vec![])),
            avail(meta("c", "1.1", vec![])),
        ]);
        let host = host();
        let reqs = [Requirement::named("a"), Requirement::named("b")];

        let first = Solver::new(&source, &host)
            .best_solution(&reqs, &core(&["a", "b"]))
            .unwrap();
        let second = Solver::new(&source, &host)
            .best_solution(&reqs, &core(&["a", "b"]))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_budget_exceeded_is_an_error() {
        // Every pair is rejected because b excludes every a
        let mut never = Requirement::named("a");
        never.max_version = Some(v("0.1"));
        let mut candidates = Vec::new();
        for i in 1..=20 {
            candidates.push(avail(meta("a", &format!("{}.0", i), vec![])));
            candidates.push(avail(meta("b", &format!("{}.0", i), vec![never.clone()])));
        }
        let source = Fixed(candidates);
        let host = host();
        let reqs = [Requirement::named("a"), Requirement::named("b")];

        let mut solver = Solver::new(&source, &host).with_budget(50);
        let err = solver.best_solution(&reqs, &core(&["a", "b"])).unwrap_err();
        assert!(matches!(err, Error::SolverBudgetExceeded(50)));

        let mut solver = Solver::new(&source, &host);
        assert!(solver.best_solution(&reqs, &core(&["a", "b"])).unwrap().is_none());
        assert_eq!(solver.checked(), 400);
    }
}
