//! Structural plan validation

use std::collections::{HashMap, HashSet};

use super::PlanError;
use crate::types::ExecutionStep;

/// Bindings imply dependencies; add the missing edges
pub(crate) fn derive_depends_on_from_bindings(step: &mut ExecutionStep) {
    for binding in &step.bindings {
        if !step.depends_on.contains(&binding.from_step) {
            step.depends_on.push(binding.from_step.clone());
        }
    }
}

pub(crate) fn validate_structure(steps: &[ExecutionStep]) -> Result<(), PlanError> {
    if steps.is_empty() {
        return Err(PlanError::EmptyPlan);
    }

    let mut seen_ids = HashSet::new();
    for step in steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(PlanError::DuplicateStepId(step.id.to_string()));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(PlanError::MissingDependency {
                    step: step.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
            if dep == &step.id {
                return Err(PlanError::CycleDetected(step.id.to_string()));
            }
        }
    }

    detect_cycles(steps)
}

/// Depth-first search over dependency edges
fn detect_cycles(steps: &[ExecutionStep]) -> Result<(), PlanError> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        adj.entry(step.id.as_str()).or_default();
        for dep in &step.depends_on {
            adj.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    fn dfs<'a>(
        node: &'a str,
        adj: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> Option<&'a str> {
        visited.insert(node);
        rec_stack.insert(node);

        if let Some(neighbors) = adj.get(node) {
            for &neighbor in neighbors {
                if !visited.contains(neighbor) {
                    if let Some(cycle_node) = dfs(neighbor, adj, visited, rec_stack) {
                        return Some(cycle_node);
                    }
                } else if rec_stack.contains(neighbor) {
                    return Some(neighbor);
                }
            }
        }

        rec_stack.remove(node);
        None
    }

    for step in steps {
        if !visited.contains(step.id.as_str()) {
            if let Some(cycle_node) = dfs(step.id.as_str(), &adj, &mut visited, &mut rec_stack) {
                return Err(PlanError::CycleDetected(cycle_node.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStep, ParamBinding, StepId};

    #[test]
    fn test_rejects_cycle() {
        let steps = vec![
            ExecutionStep::new("s1", "a").with_depends_on(vec!["s3".into()]),
            ExecutionStep::new("s2", "b").with_depends_on(vec!["s1".into()]),
            ExecutionStep::new("s3", "c").with_depends_on(vec!["s2".into()]),
        ];
        assert!(matches!(
            validate_structure(&steps),
            Err(PlanError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_rejects_self_dependency_and_missing_dependency() {
        let self_loop = vec![ExecutionStep::new("s1", "a").with_depends_on(vec!["s1".into()])];
        assert!(matches!(
            validate_structure(&self_loop),
            Err(PlanError::CycleDetected(id)) if id == "s1"
        ));

        let dangling = vec![ExecutionStep::new("s1", "a").with_depends_on(vec!["s9".into()])];
        assert!(matches!(
            validate_structure(&dangling),
            Err(PlanError::MissingDependency { dependency, .. }) if dependency == "s9"
        ));
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        let dup = vec![ExecutionStep::new("s1", "a"), ExecutionStep::new("s1", "b")];
        assert!(matches!(
            validate_structure(&dup),
            Err(PlanError::DuplicateStepId(_))
        ));
        assert!(matches!(validate_structure(&[]), Err(PlanError::EmptyPlan)));
    }

    #[test]
    fn test_bindings_add_dependencies() {
        let mut step = ExecutionStep::new("s2", "send_email")
            .with_bindings(vec![ParamBinding::new("to", "s1", "email")]);
        derive_depends_on_from_bindings(&mut step);
        derive_depends_on_from_bindings(&mut step);
        assert_eq!(step.depends_on, vec![StepId::from("s1")]);
    }
}
