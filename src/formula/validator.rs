//! Formula Validation
//!
//! Structural checks run by `cook` on the merged step list:
//! - Non-empty, unique step ids
//! - Every `needs` entry resolves to a step of the same template
//! - No cyclic dependencies (Kahn's algorithm)
//! - The exit step exists

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use super::model::ProtoStep;
use crate::error::CompileError;

/// Validates a flattened step list belonging to `formula`.
///
/// Declaration order is preserved; the topological order computed here is
/// only used to prove the graph is acyclic.
pub fn validate_steps(formula: &str, steps: &[ProtoStep]) -> Result<(), CompileError> {
    if steps.is_empty() {
        return Err(CompileError::EmptyFormula(formula.to_string()));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(CompileError::DuplicateStep {
                formula: formula.to_string(),
                step: step.id.clone(),
            });
        }
    }

    for step in steps {
        for dep in &step.needs {
            if !seen_ids.contains(dep.as_str()) {
                return Err(CompileError::UnresolvedDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let order = topological_order(steps).ok_or_else(|| CompileError::Cyclic(formula.to_string()))?;
    debug!("Formula '{}' topological order: {:?}", formula, order);
    Ok(())
}

/// Returns step ids in dependency order, or `None` when a cycle exists.
pub fn topological_order(steps: &[ProtoStep]) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        let unique: HashSet<&str> = step.needs.iter().map(String::as_str).collect();
        in_degree.insert(step.id.as_str(), unique.len());
        for dep in unique {
            dependents.entry(dep).or_default().push(step.id.as_str());
        }
    }

    // Seed in declaration order so the result is deterministic
    let mut queue: VecDeque<&str> = steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted_order = Vec::with_capacity(steps.len());

    while let Some(current) = queue.pop_front() {
        sorted_order.push(current.to_string());

        for &successor in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
        }
    }

    if sorted_order.len() != steps.len() {
        return None;
    }
    Some(sorted_order)
}

/// Picks the exit step: the explicit one if given, else the last declared
/// step that nothing depends on.
pub fn resolve_exit(
    formula: &str,
    steps: &[ProtoStep],
    explicit: Option<&str>,
) -> Result<String, CompileError> {
    if let Some(exit) = explicit {
        if steps.iter().any(|s| s.id == exit) {
            return Ok(exit.to_string());
        }
        return Err(CompileError::UnknownExit {
            formula: formula.to_string(),
            exit: exit.to_string(),
        });
    }

    let depended_on: HashSet<&str> = steps
        .iter()
        .flat_map(|s| s.needs.iter().map(String::as_str))
        .collect();

    steps
        .iter()
        .rev()
        .find(|s| !depended_on.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .ok_or_else(|| CompileError::Cyclic(formula.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, needs: &[&str]) -> ProtoStep {
        ProtoStep {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_valid_chain() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        assert!(validate_steps("f", &steps).is_ok());
        assert_eq!(topological_order(&steps).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_formula() {
        assert_eq!(
            validate_steps("f", &[]),
            Err(CompileError::EmptyFormula("f".to_string()))
        );
    }

    #[test]
    fn test_duplicate_ids() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert!(matches!(
            validate_steps("f", &steps),
            Err(CompileError::DuplicateStep { .. })
        ));
    }

    #[test]
    fn test_unresolved_dependency() {
        let steps = vec![step("a", &["ghost"])];
        assert_eq!(
            validate_steps("f", &steps),
            Err(CompileError::UnresolvedDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn test_cyclic_dependency() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        assert_eq!(
            validate_steps("f", &steps),
            Err(CompileError::Cyclic("f".to_string()))
        );
    }

    #[test]
    fn test_self_dependency_is_cyclic() {
        let steps = vec![step("a", &["a"])];
        assert!(matches!(validate_steps("f", &steps), Err(CompileError::Cyclic(_))));
    }

    #[test]
    fn test_repeated_need_is_counted_once() {
        let steps = vec![step("a", &[]), step("b", &["a", "a"])];
        assert!(validate_steps("f", &steps).is_ok());
    }

    #[test]
    fn test_resolve_exit_defaults_to_last_leaf() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("side", &[]), step("c", &["b"])];
        assert_eq!(resolve_exit("f", &steps, None).unwrap(), "c");
    }

    #[test]
    fn test_resolve_exit_explicit_unknown() {
        let steps = vec![step("a", &[])];
        assert!(matches!(
            resolve_exit("f", &steps, Some("z")),
            Err(CompileError::UnknownExit { .. })
        ));
    }
}
