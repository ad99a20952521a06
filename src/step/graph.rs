/// Step graph closure
///
/// For a step with dependencies `[d1, d2, ...]` and base `b` the closure is
/// `closure(d1) ++ closure(d2) ++ ... ++ closure(b) ++ [step]`, keeping only
/// the first occurrence of each id. Non-cacheable steps are walked through
/// but never emitted.
use std::collections::HashSet;

use super::{Base, Step, StepId};

/// Deduplicated, dependency-ordered cacheable steps required by `step`
pub fn closure(step: &Step) -> Vec<Step> {
    closure_of_all(std::slice::from_ref(step))
}

/// Closure over several terminal steps, deduplicated across all of them
pub fn closure_of_all(steps: &[Step]) -> Vec<Step> {
    let mut visited = HashSet::new();
    let mut ordered = Vec::new();

    for step in steps {
        visit(step, &mut visited, &mut ordered);
    }

    ordered
}

/// Ids of [`closure`], in the same order
pub fn closure_ids(step: &Step) -> Vec<StepId> {
    closure(step).iter().map(|s| s.id().clone()).collect()
}

fn visit(step: &Step, visited: &mut HashSet<StepId>, ordered: &mut Vec<Step>) {
    // A visited step has already emitted its whole closure
    if visited.contains(step.id()) {
        return;
    }

    for dependency in step.dependencies() {
        visit(dependency, visited, ordered);
    }

    if let Base::Step(base) = step.base() {
        visit(base, visited, ordered);
    }

    visited.insert(step.id().clone());

    if step.is_cacheable() {
        ordered.push(step.clone());
    }
}
